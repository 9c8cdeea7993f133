//! Operations: the replicated mutations of a tablet.
//!
//! [`OperationRequest`] is the closed set of things a tablet can replicate.
//! It is what travels in the log (bincode in the replicate payload) and is
//! decoded once, when a replica receives an entry. [`Operation`] wraps a
//! request with the per-operation state filled in while it moves through
//! the pipeline.

use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use granite_common::datum::Datum;
use granite_common::error::{GraniteError, GraniteResult};
use granite_common::schema::Schema;
use granite_common::types::{ClientRequestId, ColumnId, TabletId, TransactionId};
use granite_common::{HybridTime, OpId};
use granite_raft::{ConsensusRound, OpType};

use crate::locks::{RowLocks, WritePermit};

// ── Requests ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOpKind {
    /// Fails with AlreadyPresent if the row exists.
    Insert,
    Upsert,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowOp {
    pub kind: RowOpKind,
    pub key: Vec<u8>,
    pub columns: Vec<(ColumnId, Datum)>,
}

impl RowOp {
    pub fn insert(key: impl Into<Vec<u8>>, columns: Vec<(ColumnId, Datum)>) -> Self {
        RowOp {
            kind: RowOpKind::Insert,
            key: key.into(),
            columns,
        }
    }

    pub fn upsert(key: impl Into<Vec<u8>>, columns: Vec<(ColumnId, Datum)>) -> Self {
        RowOp {
            kind: RowOpKind::Upsert,
            key: key.into(),
            columns,
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        RowOp {
            kind: RowOpKind::Delete,
            key: key.into(),
            columns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub schema_version: u32,
    pub rows: Vec<RowOp>,
    /// Provisional writes of a distributed transaction go to the intents DB.
    pub transaction: Option<TransactionId>,
    pub client_request: Option<ClientRequestId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMetadataRequest {
    pub schema: Schema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Committed { commit_ht: HybridTime },
    Aborted,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Committed { .. } => "COMMITTED",
            TransactionStatus::Aborted => "ABORTED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateTransactionRequest {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotOperation {
    Create,
    Delete,
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub snapshot_id: String,
    pub operation: SnapshotOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCutoffRequest {
    pub cutoff: HybridTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRequest {
    pub split_key: Vec<u8>,
    pub children: [TabletId; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationRequest {
    Write(WriteRequest),
    ChangeMetadata(ChangeMetadataRequest),
    UpdateTransaction(UpdateTransactionRequest),
    Truncate,
    Snapshot(SnapshotRequest),
    HistoryCutoff(HistoryCutoffRequest),
    Split(SplitRequest),
    /// Not replicated: publishes a propagated safe time on a follower.
    Empty { propagated_safe_time: HybridTime },
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::Write(_) => OperationKind::Write,
            OperationRequest::ChangeMetadata(_) => OperationKind::ChangeMetadata,
            OperationRequest::UpdateTransaction(_) => OperationKind::UpdateTransaction,
            OperationRequest::Truncate => OperationKind::Truncate,
            OperationRequest::Snapshot(_) => OperationKind::Snapshot,
            OperationRequest::HistoryCutoff(_) => OperationKind::HistoryCutoff,
            OperationRequest::Split(_) => OperationKind::Split,
            OperationRequest::Empty { .. } => OperationKind::Empty,
        }
    }

    pub fn encode(&self) -> GraniteResult<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| GraniteError::internal_bug("ENCODE_OPERATION", format!("{e}")))
    }

    /// Decode a replicated entry. Consensus-internal and unknown types never
    /// belong to a tablet and are reported as bugs.
    pub fn decode(op_type: OpType, payload: &[u8]) -> GraniteResult<Self> {
        let expected = match op_type {
            OpType::Write => OperationKind::Write,
            OpType::ChangeMetadata => OperationKind::ChangeMetadata,
            OpType::UpdateTransaction => OperationKind::UpdateTransaction,
            OpType::Truncate => OperationKind::Truncate,
            OpType::Snapshot => OperationKind::Snapshot,
            OpType::HistoryCutoff => OperationKind::HistoryCutoff,
            OpType::Split => OperationKind::Split,
            OpType::NoOp | OpType::ChangeConfig | OpType::Unknown => {
                return Err(GraniteError::internal_bug(
                    "UNEXPECTED_OP_TYPE",
                    format!("{op_type} entry handed to the tablet"),
                ));
            }
        };
        let request: OperationRequest = bincode::deserialize(payload)
            .map_err(|e| GraniteError::Corruption(format!("undecodable {op_type} entry: {e}")))?;
        if request.kind() != expected {
            return Err(GraniteError::Corruption(format!(
                "{op_type} entry carries a {} payload",
                request.kind()
            )));
        }
        Ok(request)
    }

    pub fn client_request(&self) -> Option<ClientRequestId> {
        match self {
            OperationRequest::Write(w) => w.client_request,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Write,
    ChangeMetadata,
    UpdateTransaction,
    Truncate,
    Snapshot,
    HistoryCutoff,
    Split,
    Empty,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Write => "write",
            OperationKind::ChangeMetadata => "change_metadata",
            OperationKind::UpdateTransaction => "update_transaction",
            OperationKind::Truncate => "truncate",
            OperationKind::Snapshot => "snapshot",
            OperationKind::HistoryCutoff => "history_cutoff",
            OperationKind::Split => "split",
            OperationKind::Empty => "empty",
        }
    }

    /// Log entry type, `None` for in-memory operations.
    pub fn op_type(self) -> Option<OpType> {
        match self {
            OperationKind::Write => Some(OpType::Write),
            OperationKind::ChangeMetadata => Some(OpType::ChangeMetadata),
            OperationKind::UpdateTransaction => Some(OpType::UpdateTransaction),
            OperationKind::Truncate => Some(OpType::Truncate),
            OperationKind::Snapshot => Some(OpType::Snapshot),
            OperationKind::HistoryCutoff => Some(OpType::HistoryCutoff),
            OperationKind::Split => Some(OpType::Split),
            OperationKind::Empty => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Completion ─────────────────────────────────────────────────────────────

/// What a successful operation reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationOutcome {
    pub op_id: OpId,
    pub hybrid_time: HybridTime,
}

pub type CompletionCallback = Box<dyn FnOnce(GraniteResult<OperationOutcome>) + Send>;

/// Receiving half of [`completion_channel`].
pub struct CompletionReceiver(mpsc::Receiver<GraniteResult<OperationOutcome>>);

impl CompletionReceiver {
    pub fn wait(self) -> GraniteResult<OperationOutcome> {
        self.0
            .recv()
            .unwrap_or_else(|_| Err(GraniteError::Aborted("operation dropped without completing".into())))
    }

    pub fn wait_timeout(self, timeout: Duration) -> GraniteResult<OperationOutcome> {
        match self.0.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Err(GraniteError::TimedOut(format!("operation did not complete in {timeout:?}")))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(GraniteError::Aborted("operation dropped without completing".into()))
            }
        }
    }
}

/// A completion callback that forwards its result to a receiver.
pub fn completion_channel() -> (CompletionCallback, CompletionReceiver) {
    let (tx, rx) = mpsc::channel();
    let callback: CompletionCallback = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (callback, CompletionReceiver(rx))
}

// ── Operation ──────────────────────────────────────────────────────────────

/// A request plus the state it accumulates in the pipeline.
pub struct Operation {
    request: OperationRequest,
    op_id: OpId,
    hybrid_time: HybridTime,
    round: Option<Arc<ConsensusRound>>,
    completion: Option<CompletionCallback>,
    pub(crate) row_locks: Option<RowLocks>,
    pub(crate) write_permit: Option<WritePermit>,
    /// Set by prepare when a schema change turns out to change nothing.
    pub(crate) is_noop: bool,
}

impl Operation {
    pub fn new(request: OperationRequest) -> Self {
        Operation {
            request,
            op_id: OpId::INVALID,
            hybrid_time: HybridTime::INVALID,
            round: None,
            completion: None,
            row_locks: None,
            write_permit: None,
            is_noop: false,
        }
    }

    pub fn with_completion(mut self, callback: CompletionCallback) -> Self {
        self.completion = Some(callback);
        self
    }

    pub fn request(&self) -> &OperationRequest {
        &self.request
    }

    pub fn kind(&self) -> OperationKind {
        self.request.kind()
    }

    pub fn op_id(&self) -> OpId {
        self.op_id
    }

    pub fn hybrid_time(&self) -> HybridTime {
        self.hybrid_time
    }

    pub fn round(&self) -> Option<&Arc<ConsensusRound>> {
        self.round.as_ref()
    }

    pub(crate) fn set_round(&mut self, round: Arc<ConsensusRound>) {
        self.round = Some(round);
    }

    pub(crate) fn set_op_id_and_time(&mut self, op_id: OpId, ht: HybridTime) {
        self.op_id = op_id;
        self.hybrid_time = ht;
    }

    pub(crate) fn release_locks(&mut self) {
        self.row_locks = None;
        self.write_permit = None;
    }

    /// Fire the completion callback. Later calls are no-ops.
    pub(crate) fn complete(&mut self, result: GraniteResult<()>) {
        self.release_locks();
        if let Some(callback) = self.completion.take() {
            callback(result.map(|()| OperationOutcome {
                op_id: self.op_id,
                hybrid_time: self.hybrid_time,
            }));
        }
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        if self.completion.is_some() {
            self.complete(Err(GraniteError::Aborted(format!(
                "{} operation dropped before completion",
                self.kind()
            ))));
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind())
            .field("op_id", &self.op_id)
            .field("hybrid_time", &self.hybrid_time)
            .finish()
    }
}
