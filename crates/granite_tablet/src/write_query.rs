//! Client write entry point.

use std::time::Instant;

use granite_common::error::GraniteError;

use crate::operation::{CompletionCallback, Operation, OperationRequest, WriteRequest};

/// A client write on its way into a tablet peer. Either turned into a
/// write operation or cancelled; the callback fires exactly once.
pub struct WriteQuery {
    request: WriteRequest,
    callback: Option<CompletionCallback>,
    received: Instant,
}

impl WriteQuery {
    pub fn new(request: WriteRequest, callback: CompletionCallback) -> Self {
        WriteQuery {
            request,
            callback: Some(callback),
            received: Instant::now(),
        }
    }

    pub fn request(&self) -> &WriteRequest {
        &self.request
    }

    pub fn received(&self) -> Instant {
        self.received
    }

    pub fn cancel(mut self, error: GraniteError) {
        if let Some(callback) = self.callback.take() {
            callback(Err(error));
        }
    }

    pub(crate) fn into_operation(self) -> Operation {
        let WriteQuery { request, callback, .. } = self;
        let op = Operation::new(OperationRequest::Write(request));
        match callback {
            Some(callback) => op.with_completion(callback),
            None => op,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::completion_channel;

    #[test]
    fn test_cancel_reports_error() {
        let (cb, rx) = completion_channel();
        let query = WriteQuery::new(
            WriteRequest {
                schema_version: 1,
                rows: Vec::new(),
                transaction: None,
                client_request: None,
            },
            cb,
        );
        query.cancel(GraniteError::ServiceUnavailable("not running".into()));
        assert!(matches!(rx.wait(), Err(GraniteError::ServiceUnavailable(_))));
    }
}
