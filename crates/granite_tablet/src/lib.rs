//! Tablet replicas: storage-side operation logic, the operation pipeline
//! (prepare, replicate, apply), MVCC safe time and the tablet peer that ties
//! them to consensus.

pub mod apply_queue;
pub mod bootstrap;
pub mod driver;
pub mod locks;
pub mod log_gc;
pub mod mvcc;
pub mod operation;
pub mod peer;
pub mod preparer;
pub mod retention;
pub mod state;
pub mod tablet;
pub mod tracker;
pub mod write_query;

pub use bootstrap::{bootstrap_tablet, BootstrapResult};
pub use driver::{DriverPhase, DriverSnapshot};
pub use log_gc::{LogGcOp, LogGcRunner, MaintenanceOp};
pub use mvcc::MvccManager;
pub use preparer::PrepareLatency;
pub use operation::{
    completion_channel, ChangeMetadataRequest, CompletionCallback, CompletionReceiver, Operation,
    OperationKind, OperationOutcome, OperationRequest, RowOp, RowOpKind, SnapshotOperation, SnapshotRequest,
    SplitRequest, TransactionStatus, UpdateTransactionRequest, WriteRequest,
};
pub use peer::{
    earliest_needed_log_index, GcBoundInputs, MarkDirtyCallback, ReadConsistency, ReadRequest, ReadResponse,
    TabletPeer, TabletPeerResources, TabletStatus,
};
pub use retention::HistoryRetentionPolicy;
pub use state::TabletPeerState;
pub use tablet::{
    Partition, ReadRow, SplitRecord, TableType, Tablet, TabletDataState, TabletMetadata, TabletSnapshot,
    TabletSplitter,
};
pub use write_query::WriteQuery;
