//! Background execution: the priority thread pool that schedules
//! compactions and the bounded FIFO pool that runs operation prepares.

pub mod priority_pool;
pub mod thread_pool;

pub use priority_pool::{
    CompactionInfo, PoolSnapshot, PriorityTask, PriorityTaskState, PriorityThreadPool, Suspender,
    TaskSerialNo,
};
pub use thread_pool::{ThreadPool, ThreadPoolStats};
