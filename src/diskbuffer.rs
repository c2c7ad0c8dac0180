use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::io::EventIo;

/// Recorded location of one box's payload in the backing file, in events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskPosition {
    pub start: u64,
    pub n_events: u64,
}

/// A payload staged in memory, awaiting flush.
struct Staged {
    box_id: u64,
    n_events: u64,
    rows: Vec<f64>,
}

/// State guarded by the buffer's single internal lock.
///
/// The open handle lives inside the lock: every flush and load is serialized
/// against the file-offset bookkeeping, independent of all controller locks.
struct Inner {
    io: Box<dyn EventIo>,
    staged: VecDeque<Staged>,
    staged_events: u64,
    positions: HashMap<u64, DiskPosition>,
    /// Length of the backing file, in events. New payloads are appended here.
    file_length: u64,
}

/// Bounded in-memory write buffer over the tree's single backing file.
///
/// Leaf boxes stage their evicted payloads here; once the accumulated staged
/// events exceed the configured budget, victims are drained in FIFO staging
/// order and written contiguously at the end of the file, recording each
/// box's offset and length. FIFO is a policy choice of this implementation,
/// not a guarantee callers may rely on.
///
/// Boxes never see the file handle, only `stage`/`load`. Freed payloads of
/// boxes that have since split are forgotten but their file space is not
/// reclaimed.
pub struct DiskBuffer {
    inner: Mutex<Inner>,
    /// Flush budget in events. Atomic so get/set never contend with a flush.
    write_buffer_size: AtomicU64,
    filename: PathBuf,
}

impl DiskBuffer {
    /// Default flush budget, in events.
    pub const DEFAULT_WRITE_BUFFER_SIZE: u64 = 10_000_000;

    /// Open `io` at `path` and take exclusive ownership of the handle.
    ///
    /// The file length is read back from the store, so re-opening an
    /// existing file resumes appending after its current contents. Failure
    /// here is recoverable for the caller: no buffer is created and the tree
    /// stays in-memory.
    pub fn open(mut io: Box<dyn EventIo>, path: &Path, row_len: usize) -> Result<Self> {
        io.set_row_len(row_len);
        io.open(path)?;
        let file_length = io.file_length();
        Ok(Self {
            inner: Mutex::new(Inner {
                io,
                staged: VecDeque::new(),
                staged_events: 0,
                positions: HashMap::new(),
                file_length,
            }),
            write_buffer_size: AtomicU64::new(Self::DEFAULT_WRITE_BUFFER_SIZE),
            filename: path.to_path_buf(),
        })
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn file_length(&self) -> u64 {
        self.lock().file_length
    }

    /// Override the recorded file length (in events). Used when attaching to
    /// a store whose logical length differs from its physical one.
    pub fn set_file_length(&self, n_events: u64) {
        self.lock().file_length = n_events;
    }

    pub fn write_buffer_size(&self) -> u64 {
        self.write_buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_write_buffer_size(&self, n_events: u64) {
        self.write_buffer_size.store(n_events, Ordering::Relaxed);
    }

    /// Events currently staged in memory, awaiting flush.
    pub fn write_buffer_used(&self) -> u64 {
        self.lock().staged_events
    }

    /// Number of boxes with a recorded position in the backing file.
    pub fn num_boxes_on_file(&self) -> usize {
        self.lock().positions.len()
    }

    pub fn position_of(&self, box_id: u64) -> Option<DiskPosition> {
        self.lock().positions.get(&box_id).copied()
    }

    /// Mark a box's payload dirty-in-buffer. Re-staging a box replaces its
    /// previously staged payload. When the accumulated staged events exceed
    /// the budget, the buffer flushes to the file before returning; a write
    /// failure during that flush propagates to this caller.
    pub fn stage(&self, box_id: u64, n_events: u64, rows: Vec<f64>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(idx) = inner.staged.iter().position(|s| s.box_id == box_id) {
            let old = inner.staged.remove(idx).ok_or_else(|| {
                Error::Logic("staged entry vanished while replacing it".into())
            })?;
            inner.staged_events -= old.n_events;
        }
        inner.staged.push_back(Staged {
            box_id,
            n_events,
            rows,
        });
        inner.staged_events += n_events;
        trace!(box_id, n_events, staged = inner.staged_events, "staged payload");

        if inner.staged_events > self.write_buffer_size() {
            Self::flush_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Return a box's payload: from the staged queue when resident, else
    /// from its recorded file position.
    pub fn load(&self, box_id: u64) -> Result<(u64, Vec<f64>)> {
        let mut inner = self.lock();
        if let Some(s) = inner.staged.iter().find(|s| s.box_id == box_id) {
            return Ok((s.n_events, s.rows.clone()));
        }
        match inner.positions.get(&box_id).copied() {
            Some(pos) => {
                let rows = inner.io.read(pos.start, pos.n_events)?;
                Ok((pos.n_events, rows))
            }
            None => Err(Error::Logic(format!(
                "box {box_id} has no staged or on-file payload"
            ))),
        }
    }

    /// Drop everything the buffer knows about a box (post-split cleanup).
    /// A no-op when the box was never staged. File space is not reclaimed.
    pub fn forget(&self, box_id: u64) {
        let mut inner = self.lock();
        if let Some(idx) = inner.staged.iter().position(|s| s.box_id == box_id) {
            if let Some(old) = inner.staged.remove(idx) {
                inner.staged_events -= old.n_events;
            }
        }
        inner.positions.remove(&box_id);
    }

    /// Force-write every staged payload regardless of the budget.
    pub fn flush(&self) -> Result<()> {
        Self::flush_locked(&mut self.lock())
    }

    fn flush_locked(inner: &mut Inner) -> Result<()> {
        let n_boxes = inner.staged.len();
        let mut written = 0_u64;
        while let Some(s) = inner.staged.pop_front() {
            let start = inner.file_length;
            if let Err(e) = inner.io.write(start, s.n_events, &s.rows) {
                // Keep the unwritten payload; dropping it here would lose
                // evicted events.
                inner.staged.push_front(s);
                return Err(e);
            }
            inner.positions.insert(
                s.box_id,
                DiskPosition {
                    start,
                    n_events: s.n_events,
                },
            );
            inner.file_length += s.n_events;
            inner.staged_events -= s.n_events;
            written += s.n_events;
        }
        if written > 0 {
            debug!(n_boxes, written, "flushed write buffer to file");
        }
        Ok(())
    }

    /// Flush outstanding payloads and close the file handle.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        Self::flush_locked(&mut inner)?;
        inner.io.close()
    }
}

impl std::fmt::Debug for DiskBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskBuffer")
            .field("filename", &self.filename)
            .field("write_buffer_size", &self.write_buffer_size())
            .finish_non_exhaustive()
    }
}
