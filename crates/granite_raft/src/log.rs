//! Replicated log interface and the segmented in-memory log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use granite_common::error::{ConsensusError, GraniteError, GraniteResult};
use granite_common::OpId;

use crate::round::ReplicateMsg;

/// Durable, index-addressed record of replicated entries.
pub trait ReplicatedLog: Send + Sync {
    /// Append the next entry. Its index must follow the latest entry.
    fn append(&self, msg: ReplicateMsg) -> GraniteResult<u64>;

    fn latest_entry_op_id(&self) -> OpId;

    /// Index of the oldest retained entry, 0 when the log is empty.
    fn first_index(&self) -> u64;

    /// Reclaim whole segments that only hold entries below `min_index`.
    /// Returns the number of segments reclaimed.
    fn gc(&self, min_index: u64) -> GraniteResult<usize>;

    /// Entries from `index` (inclusive) to the end of the log.
    fn read_from(&self, index: u64) -> GraniteResult<Vec<ReplicateMsg>>;

    /// Drop every entry above `index`.
    fn truncate_after(&self, index: u64) -> GraniteResult<()>;

    /// Record the committed position so that bootstrap can find it.
    fn mark_committed(&self, op_id: OpId);

    fn last_committed_op_id(&self) -> OpId;

    fn segment_count(&self) -> usize;

    /// Approximate bytes held by the log.
    fn size_bytes(&self) -> u64;

    fn close(&self);
}

struct Segment {
    first_index: u64,
    entries: Vec<ReplicateMsg>,
}

impl Segment {
    fn last_index(&self) -> u64 {
        self.first_index + self.entries.len() as u64 - 1
    }
}

struct LogData {
    segments: Vec<Segment>,
    segment_entries: usize,
    last_op_id: OpId,
    committed: OpId,
}

/// In-memory log that groups entries into fixed-size segments.
///
/// The data outlives any single handle: `reopen` returns a fresh handle on
/// the same entries, which is how a restarted tablet finds its log.
pub struct MemLog {
    data: Arc<Mutex<LogData>>,
    closed: AtomicBool,
}

impl MemLog {
    pub fn new(segment_entries: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Arc::new(Mutex::new(LogData {
                segments: Vec::new(),
                segment_entries: segment_entries.max(1),
                last_op_id: OpId::INVALID,
                committed: OpId::INVALID,
            })),
            closed: AtomicBool::new(false),
        })
    }

    pub fn reopen(&self) -> Arc<Self> {
        Arc::new(Self {
            data: Arc::clone(&self.data),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> GraniteResult<()> {
        if self.is_closed() {
            return Err(ConsensusError::LogClosed.into());
        }
        Ok(())
    }
}

impl ReplicatedLog for MemLog {
    fn append(&self, msg: ReplicateMsg) -> GraniteResult<u64> {
        self.check_open()?;
        let mut data = self.data.lock();
        let index = msg.op_id.index;
        let expected = data.last_op_id.index + 1;
        if data.last_op_id.is_valid() && index != expected {
            return Err(GraniteError::IllegalState(format!(
                "log append out of order: got index {index}, expected {expected}"
            )));
        }
        if msg.op_id < data.last_op_id {
            return Err(GraniteError::IllegalState(format!(
                "log append with op id {} below latest {}",
                msg.op_id, data.last_op_id
            )));
        }
        let segment_entries = data.segment_entries;
        let needs_segment = data
            .segments
            .last()
            .map_or(true, |s| s.entries.len() >= segment_entries);
        if needs_segment {
            data.segments.push(Segment {
                first_index: index,
                entries: Vec::with_capacity(segment_entries),
            });
        }
        data.last_op_id = msg.op_id;
        if let Some(segment) = data.segments.last_mut() {
            segment.entries.push(msg);
        }
        Ok(index)
    }

    fn latest_entry_op_id(&self) -> OpId {
        self.data.lock().last_op_id
    }

    fn first_index(&self) -> u64 {
        self.data
            .lock()
            .segments
            .first()
            .map(|s| s.first_index)
            .unwrap_or(0)
    }

    fn gc(&self, min_index: u64) -> GraniteResult<usize> {
        self.check_open()?;
        let mut data = self.data.lock();
        let mut reclaimed = 0;
        // The active segment is always kept.
        while data.segments.len() > 1 && data.segments[0].last_index() < min_index {
            data.segments.remove(0);
            reclaimed += 1;
        }
        if reclaimed > 0 {
            tracing::debug!(min_index, reclaimed, "log segments reclaimed");
        }
        Ok(reclaimed)
    }

    fn read_from(&self, index: u64) -> GraniteResult<Vec<ReplicateMsg>> {
        let data = self.data.lock();
        let Some(first) = data.segments.first() else {
            return Ok(Vec::new());
        };
        if index < first.first_index {
            return Err(ConsensusError::LogEntryGone { index }.into());
        }
        Ok(data
            .segments
            .iter()
            .filter(|s| s.last_index() >= index)
            .flat_map(|s| s.entries.iter())
            .filter(|e| e.op_id.index >= index)
            .cloned()
            .collect())
    }

    fn truncate_after(&self, index: u64) -> GraniteResult<()> {
        self.check_open()?;
        let mut data = self.data.lock();
        if index < data.committed.index {
            return Err(GraniteError::IllegalState(format!(
                "cannot truncate log to {index}, committed index is {}",
                data.committed.index
            )));
        }
        for segment in data.segments.iter_mut() {
            segment.entries.retain(|e| e.op_id.index <= index);
        }
        data.segments.retain(|s| !s.entries.is_empty());
        let last = data
            .segments
            .last()
            .and_then(|s| s.entries.last())
            .map(|e| e.op_id);
        if let Some(last) = last {
            data.last_op_id = last;
        } else if index < data.last_op_id.index {
            data.last_op_id = data.committed;
        }
        Ok(())
    }

    fn mark_committed(&self, op_id: OpId) {
        let mut data = self.data.lock();
        if op_id > data.committed {
            data.committed = op_id;
        }
    }

    fn last_committed_op_id(&self) -> OpId {
        self.data.lock().committed
    }

    fn segment_count(&self) -> usize {
        self.data.lock().segments.len()
    }

    fn size_bytes(&self) -> u64 {
        self.data
            .lock()
            .segments
            .iter()
            .flat_map(|s| s.entries.iter())
            .map(|e| e.encoded_len() as u64)
            .sum()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
