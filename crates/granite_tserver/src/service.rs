//! Tablet service: the request surface of the tablet server.
//!
//! Every call first folds the caller's hybrid time into the server clock and
//! every response, failed or not, carries the server's clock reading.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use granite_common::error::{GraniteError, GraniteResult};
use granite_common::schema::Schema;
use granite_common::types::TabletId;
use granite_common::{HybridTime, OpId};
use granite_tablet::{
    completion_channel, ChangeMetadataRequest, Operation, OperationOutcome, OperationRequest, ReadRequest,
    ReadResponse, SplitRequest, TabletDataState, TabletPeer, TabletStatus, WriteQuery, WriteRequest,
};

use crate::manager::TabletManager;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a service call plus the server's hybrid time when it finished.
#[derive(Debug)]
pub struct Response<T> {
    pub propagated_hybrid_time: HybridTime,
    pub result: GraniteResult<T>,
}

impl<T> Response<T> {
    pub fn into_result(self) -> GraniteResult<T> {
        self.result
    }
}

#[derive(Debug, Clone)]
pub struct WriteTabletRequest {
    pub tablet_id: TabletId,
    pub write: WriteRequest,
    pub propagated_hybrid_time: Option<HybridTime>,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTabletResponse {
    /// Invalid for a write that carried no rows.
    pub op_id: OpId,
    pub hybrid_time: HybridTime,
}

#[derive(Debug, Clone)]
pub struct ReadTabletRequest {
    pub tablet_id: TabletId,
    pub read: ReadRequest,
    pub propagated_hybrid_time: Option<HybridTime>,
}

#[derive(Debug, Clone)]
pub struct AlterSchemaRequest {
    pub tablet_id: TabletId,
    pub schema: Schema,
    pub propagated_hybrid_time: Option<HybridTime>,
}

#[derive(Debug, Clone)]
pub struct SplitTabletRequest {
    pub tablet_id: TabletId,
    /// Middle row of the tablet when absent.
    pub split_key: Option<Vec<u8>>,
    pub children: [TabletId; 2],
    pub propagated_hybrid_time: Option<HybridTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushOperation {
    Flush,
    Compact,
    LogGc,
}

impl FlushOperation {
    fn as_str(self) -> &'static str {
        match self {
            FlushOperation::Flush => "flush",
            FlushOperation::Compact => "compact",
            FlushOperation::LogGc => "log_gc",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlushTabletsRequest {
    pub all_tablets: bool,
    pub tablet_ids: Vec<TabletId>,
    pub operation: FlushOperation,
    pub propagated_hybrid_time: Option<HybridTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumResponse {
    pub checksum: u32,
    pub rows: u64,
    pub read_time: HybridTime,
}

pub struct TabletService {
    manager: Arc<TabletManager>,
}

impl TabletService {
    pub fn new(manager: Arc<TabletManager>) -> Self {
        TabletService { manager }
    }

    pub fn manager(&self) -> &Arc<TabletManager> {
        &self.manager
    }

    fn call<T>(
        &self,
        method: &'static str,
        propagated: Option<HybridTime>,
        f: impl FnOnce() -> GraniteResult<T>,
    ) -> Response<T> {
        let clock = self.manager.clock();
        if let Some(ht) = propagated.filter(|ht| ht.is_valid()) {
            clock.update(ht);
        }
        let started = Instant::now();
        let result = f();
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => {
                debug!(method, code = e.code(), error = %e, "tablet service call failed");
                e.code()
            }
        };
        granite_observability::record_rpc(method, outcome, started.elapsed().as_micros() as u64);
        Response {
            propagated_hybrid_time: clock.now(),
            result,
        }
    }

    /// Replicate `request` through the leader of `tablet_id` and wait for it
    /// to apply.
    fn replicate(
        &self,
        tablet_id: &TabletId,
        request: OperationRequest,
        deadline: Instant,
    ) -> GraniteResult<OperationOutcome> {
        let leader = self.manager.lookup_leader(tablet_id)?;
        let (callback, done) = completion_channel();
        leader
            .peer
            .submit(Operation::new(request).with_completion(callback), Some(leader.leader_term))?;
        done.wait_timeout(deadline.saturating_duration_since(Instant::now()))
    }

    fn running_peer(&self, tablet_id: &TabletId) -> GraniteResult<Arc<TabletPeer>> {
        let peer = self.manager.lookup(tablet_id)?;
        peer.check_running()?;
        Ok(peer)
    }

    pub fn write(&self, request: WriteTabletRequest) -> Response<WriteTabletResponse> {
        let WriteTabletRequest {
            tablet_id,
            write,
            propagated_hybrid_time,
            deadline,
        } = request;
        self.call("write", propagated_hybrid_time, || {
            if write.rows.is_empty() {
                self.manager.lookup(&tablet_id)?;
                return Ok(WriteTabletResponse {
                    op_id: OpId::INVALID,
                    hybrid_time: self.manager.clock().now(),
                });
            }
            let deadline = deadline.unwrap_or_else(|| Instant::now() + DEFAULT_TIMEOUT);
            let leader = self.manager.lookup_leader(&tablet_id)?;
            let (callback, done) = completion_channel();
            leader.peer.write_async(WriteQuery::new(write, callback))?;
            let outcome = done.wait_timeout(deadline.saturating_duration_since(Instant::now()))?;
            Ok(WriteTabletResponse {
                op_id: outcome.op_id,
                hybrid_time: outcome.hybrid_time,
            })
        })
    }

    pub fn read(&self, request: ReadTabletRequest) -> Response<ReadResponse> {
        self.call("read", request.propagated_hybrid_time, || {
            self.manager.lookup(&request.tablet_id)?.read(&request.read)
        })
    }

    pub fn alter_schema(&self, request: AlterSchemaRequest) -> Response<OpId> {
        let AlterSchemaRequest {
            tablet_id,
            schema,
            propagated_hybrid_time,
        } = request;
        self.call("alter_schema", propagated_hybrid_time, || {
            let current = self.running_peer(&tablet_id)?.tablet()?.schema();
            if schema.version == current.version && schema.same_columns(&current) {
                // already installed
                return Ok(OpId::INVALID);
            }
            let version = schema.version;
            let outcome = self.replicate(
                &tablet_id,
                OperationRequest::ChangeMetadata(ChangeMetadataRequest { schema }),
                Instant::now() + DEFAULT_TIMEOUT,
            )?;
            info!(%tablet_id, version, op_id = %outcome.op_id, "schema altered");
            Ok(outcome.op_id)
        })
    }

    pub fn truncate(&self, tablet_id: &TabletId, propagated: Option<HybridTime>) -> Response<OpId> {
        self.call("truncate", propagated, || {
            let outcome = self.replicate(tablet_id, OperationRequest::Truncate, Instant::now() + DEFAULT_TIMEOUT)?;
            info!(%tablet_id, op_id = %outcome.op_id, "tablet truncated");
            Ok(outcome.op_id)
        })
    }

    pub fn split_tablet(&self, request: SplitTabletRequest) -> Response<OpId> {
        let SplitTabletRequest {
            tablet_id,
            split_key,
            children,
            propagated_hybrid_time,
        } = request;
        self.call("split_tablet", propagated_hybrid_time, || {
            let tablet = self.running_peer(&tablet_id)?.tablet()?;
            if tablet.data_state() == TabletDataState::SplitCompleted {
                return Err(GraniteError::AlreadyPresent(format!("tablet {tablet_id} is already split")));
            }
            let split_key = match split_key {
                Some(key) => key,
                None => tablet.split_key()?,
            };
            let outcome = self.replicate(
                &tablet_id,
                OperationRequest::Split(SplitRequest { split_key, children }),
                Instant::now() + DEFAULT_TIMEOUT,
            )?;
            Ok(outcome.op_id)
        })
    }

    /// Safe time of the leader of `tablet_id`, at least `min_allowed`.
    pub fn get_safe_time(
        &self,
        tablet_id: &TabletId,
        min_allowed: HybridTime,
        propagated: Option<HybridTime>,
    ) -> Response<HybridTime> {
        self.call("get_safe_time", propagated, || {
            let leader = self.manager.lookup_leader(tablet_id)?;
            leader
                .peer
                .safe_time(min_allowed, Some(Instant::now() + DEFAULT_TIMEOUT))
        })
    }

    /// Flush, compact or log-GC the listed tablets, or all of them.
    /// Returns the tablets that were processed.
    pub fn flush_tablets(&self, request: FlushTabletsRequest) -> Response<Vec<TabletId>> {
        let FlushTabletsRequest {
            all_tablets,
            tablet_ids,
            operation,
            propagated_hybrid_time,
        } = request;
        self.call("flush_tablets", propagated_hybrid_time, || {
            let peers = if all_tablets {
                self.manager.peers()
            } else {
                if tablet_ids.is_empty() {
                    return Err(GraniteError::InvalidArgument("no tablets to flush".into()));
                }
                tablet_ids
                    .iter()
                    .map(|id| self.manager.lookup(id))
                    .collect::<GraniteResult<Vec<_>>>()?
            };
            let mut processed = Vec::with_capacity(peers.len());
            for peer in peers {
                if all_tablets && peer.check_running().is_err() {
                    continue;
                }
                match operation {
                    FlushOperation::Flush => peer.tablet()?.flush()?,
                    FlushOperation::Compact => peer.tablet()?.compact()?,
                    FlushOperation::LogGc => {
                        let reclaimed = peer.run_log_gc()?;
                        debug!(tablet_id = %peer.tablet_id(), reclaimed, "log gc");
                    }
                }
                processed.push(peer.tablet_id().clone());
            }
            info!(operation = operation.as_str(), tablets = processed.len(), "tablets flushed");
            Ok(processed)
        })
    }

    pub fn list_tablets(&self) -> Response<Vec<TabletStatus>> {
        self.call("list_tablets", None, || Ok(self.manager.list_tablets()))
    }

    pub fn get_tablet_status(&self, tablet_id: &TabletId) -> Response<TabletStatus> {
        self.call("get_tablet_status", None, || {
            Ok(self.manager.lookup(tablet_id)?.get_tablet_status())
        })
    }

    /// CRC32 over the rows visible at `read_time`, or at the safe time.
    pub fn checksum(&self, tablet_id: &TabletId, read_time: Option<HybridTime>) -> Response<ChecksumResponse> {
        self.call("checksum", None, || {
            let peer = self.running_peer(tablet_id)?;
            let read_time = match read_time {
                Some(ht) => {
                    peer.safe_time(ht, Some(Instant::now() + DEFAULT_TIMEOUT))?;
                    ht
                }
                None => peer.safe_time(HybridTime::INVALID, Some(Instant::now() + DEFAULT_TIMEOUT))?,
            };
            let (checksum, rows) = peer.tablet()?.checksum(read_time)?;
            Ok(ChecksumResponse {
                checksum,
                rows,
                read_time,
            })
        })
    }

    pub fn get_split_key(&self, tablet_id: &TabletId) -> Response<Vec<u8>> {
        self.call("get_split_key", None, || self.running_peer(tablet_id)?.tablet()?.split_key())
    }
}
