use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::info;

use crate::diskbuffer::DiskBuffer;
use crate::error::{Error, Result};
use crate::io::EventIo;

/// Per-depth population statistics, guarded by one dedicated lock.
#[derive(Clone, Debug, Default, PartialEq)]
struct DepthStats {
    /// Unsplit (leaf) boxes at each depth. `num_boxes[0] == 1` right after
    /// any reset: the root counts as one unsplit box at depth 0.
    num_boxes: Vec<u64>,
    /// Grid (interior) boxes at each depth.
    num_grid_boxes: Vec<u64>,
    /// Theoretical maximum of boxes at each depth: `num_split ^ depth`.
    /// Stored as f64 since the values overflow u64 within a few levels.
    max_boxes: Vec<f64>,
}

impl DepthStats {
    /// Reset every vector to its depth-0 default for the given ceiling.
    /// Shared by `set_max_depth` and the widening path of `track_num_boxes`.
    fn reset(&mut self, max_depth: usize, num_split: usize) {
        self.num_boxes = vec![0; max_depth + 1];
        self.num_boxes[0] = 1;
        self.num_grid_boxes = vec![0; max_depth + 1];
        self.recompute_max(max_depth, num_split);
    }

    /// Rebuild only the theoretical maxima, leaving the observed counts
    /// untouched. Used when the fan-out changes.
    fn recompute_max(&mut self, max_depth: usize, num_split: usize) {
        self.max_boxes = vec![0.0; max_depth + 1];
        self.max_boxes[0] = 1.0;
        for d in 1..=max_depth {
            self.max_boxes[d] = self.max_boxes[d - 1] * num_split as f64;
        }
    }
}

/// Policy and bookkeeping hub shared by every box in one tree.
///
/// The controller decides when a leaf box should split and how, hands out
/// box IDs, tracks per-depth population statistics, keeps the set of boxes
/// flagged for deferred splitting, and owns the disk write buffer when the
/// tree is file-backed.
///
/// Each shared sub-structure is synchronized independently rather than under
/// one coarse lock: during parallel insertion many workers hit different
/// leaves at once, and a single lock would serialize them on every event.
/// Hot policy scalars (`split_threshold`, `max_depth`, `num_split`) are
/// atomics so `will_split` never blocks; the ID counter is an atomic with
/// the same strict-monotonicity guarantee a dedicated mutex would give; the
/// statistics vectors, the pending-split set and the disk buffer each have
/// their own lock.
#[derive(Debug)]
pub struct BoxController {
    /// Number of dimensions. Immutable after construction.
    nd: usize,
    /// Next box ID to hand out; also the exclusive upper bound of all IDs
    /// assigned so far.
    max_id: AtomicU64,
    split_threshold: AtomicUsize,
    max_depth: AtomicUsize,
    /// Cached product of `split_into`, recomputed whenever it changes.
    num_split: AtomicUsize,
    split_into: Mutex<Vec<usize>>,
    stats: Mutex<DepthStats>,
    /// IDs of leaf boxes flagged as needing a split. Opaque handles, not
    /// references: an ID whose box has since been split simply no longer
    /// names a leaf and is skipped by the split pass.
    pending_split: Mutex<BTreeSet<u64>>,
    disk_buffer: Mutex<Option<Arc<DiskBuffer>>>,
    use_write_buffer: AtomicBool,
    write_buffer_size: AtomicU64,
    bytes_per_event: AtomicUsize,
    events_per_task: AtomicUsize,
    tasks_per_block: AtomicUsize,
}

impl BoxController {
    pub const DEFAULT_MAX_DEPTH: usize = 5;
    pub const DEFAULT_SPLIT_THRESHOLD: usize = 1000;
    pub const DEFAULT_EVENTS_PER_TASK: usize = 1000;

    pub fn new(nd: usize) -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8);
        let controller = Self {
            nd,
            max_id: AtomicU64::new(0),
            split_threshold: AtomicUsize::new(Self::DEFAULT_SPLIT_THRESHOLD),
            max_depth: AtomicUsize::new(Self::DEFAULT_MAX_DEPTH),
            num_split: AtomicUsize::new(1),
            split_into: Mutex::new(vec![1; nd]),
            stats: Mutex::new(DepthStats::default()),
            pending_split: Mutex::new(BTreeSet::new()),
            disk_buffer: Mutex::new(None),
            use_write_buffer: AtomicBool::new(true),
            write_buffer_size: AtomicU64::new(DiskBuffer::DEFAULT_WRITE_BUFFER_SIZE),
            bytes_per_event: AtomicUsize::new(0),
            events_per_task: AtomicUsize::new(Self::DEFAULT_EVENTS_PER_TASK),
            tasks_per_block: AtomicUsize::new(threads * 5),
        };
        controller
            .stats_lock()
            .reset(Self::DEFAULT_MAX_DEPTH, 1);
        controller
    }

    fn stats_lock(&self) -> MutexGuard<'_, DepthStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn split_into_lock(&self) -> MutexGuard<'_, Vec<usize>> {
        self.split_into.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending_lock(&self) -> MutexGuard<'_, BTreeSet<u64>> {
        self.pending_split.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn buffer_lock(&self) -> MutexGuard<'_, Option<Arc<DiskBuffer>>> {
        self.disk_buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- dimensions and IDs ------------------------------------------------

    pub fn num_dims(&self) -> usize {
        self.nd
    }

    /// Hand out the next box ID. Strictly increasing across all threads.
    pub fn next_id(&self) -> u64 {
        self.max_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Exclusive upper bound of all IDs assigned so far.
    pub fn max_id(&self) -> u64 {
        self.max_id.load(Ordering::Relaxed)
    }

    /// Reset the ID counter. Only meant for the file-load path.
    pub fn set_max_id(&self, new_max_id: u64) {
        self.max_id.store(new_max_id, Ordering::Relaxed);
    }

    // ---- splitting policy --------------------------------------------------

    /// Should a leaf with `num_points` events at `depth` be split?
    ///
    /// Pure and lock-free; called on every insertion. Note that with
    /// `max_depth == 0` this is always false, and no range validation is
    /// performed anywhere on the policy values: callers are trusted.
    pub fn will_split(&self, num_points: usize, depth: usize) -> bool {
        num_points > self.split_threshold.load(Ordering::Relaxed)
            && depth < self.max_depth.load(Ordering::Relaxed)
    }

    pub fn split_threshold(&self) -> usize {
        self.split_threshold.load(Ordering::Relaxed)
    }

    pub fn set_split_threshold(&self, threshold: usize) {
        self.split_threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn split_into(&self, dim: usize) -> usize {
        self.split_into_lock()[dim]
    }

    /// Snapshot of the per-dimension fan-out.
    pub fn split_into_all(&self) -> Vec<usize> {
        self.split_into_lock().clone()
    }

    /// Total number of children a leaf becomes when split.
    pub fn num_split(&self) -> usize {
        self.num_split.load(Ordering::Relaxed)
    }

    /// Set every dimension's fan-out to `num`.
    ///
    /// Recomputes `num_split` and the theoretical per-depth maxima, but does
    /// not touch the observed box counts.
    pub fn set_split_into(&self, num: usize) {
        {
            let mut split_into = self.split_into_lock();
            split_into.iter_mut().for_each(|s| *s = num);
        }
        self.recalc_num_split();
    }

    /// Set a single dimension's fan-out.
    pub fn set_split_into_dim(&self, dim: usize, num: usize) -> Result<()> {
        if dim >= self.nd {
            return Err(Error::InvalidArgument(format!(
                "split dimension {dim} out of range for a {}-dimensional tree",
                self.nd
            )));
        }
        self.split_into_lock()[dim] = num;
        self.recalc_num_split();
        Ok(())
    }

    fn recalc_num_split(&self) {
        let num_split = self.split_into_lock().iter().product::<usize>();
        self.num_split.store(num_split, Ordering::Relaxed);
        let max_depth = self.max_depth.load(Ordering::Relaxed);
        self.stats_lock().recompute_max(max_depth, num_split);
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::Relaxed)
    }

    /// Set the recursion ceiling for splitting.
    ///
    /// This resets all per-depth statistics to their depth-0 defaults: the
    /// vectors must be resized, which invalidates the existing histograms.
    pub fn set_max_depth(&self, value: usize) {
        self.max_depth.store(value, Ordering::Relaxed);
        self.stats_lock().reset(value, self.num_split());
    }

    /// Heuristic for the insertion driver: is now a good time to pause and
    /// run a global split pass?
    ///
    /// Splitting too often thrashes; too rarely lets boxes balloon. The
    /// trigger point scales down as the dataset grows, but never below one
    /// pass per 10 million added events.
    pub fn should_split_boxes(
        &self,
        n_events_in_output: usize,
        events_added: usize,
        num_leaf_boxes: usize,
    ) -> bool {
        if num_leaf_boxes == 0 {
            return false;
        }
        let comparison_point = (n_events_in_output / 16).max(10_000_000);
        if events_added > comparison_point {
            return true;
        }
        events_added / num_leaf_boxes > self.split_threshold()
    }

    // ---- per-depth statistics ----------------------------------------------

    /// Record one leaf-to-grid conversion at `depth`.
    ///
    /// Under the stats lock: the leaf count at `depth` drops by one (floored
    /// at zero; going below would be a caller bug but must not panic), the
    /// grid count at `depth` rises by one, and the leaf count at `depth + 1`
    /// rises by `num_split` (the new children).
    ///
    /// Splitting at or beyond the current ceiling silently widens
    /// `max_depth` to `depth + 1` through the same reset path as
    /// `set_max_depth`. That reset discards the counts accumulated so far at
    /// every depth, including the grid increment made just above. Whether
    /// shallower counts should survive the widening is an open question;
    /// until it is settled the two paths share one reset.
    pub fn track_num_boxes(&self, depth: usize) {
        let num_split = self.num_split();
        let mut stats = self.stats_lock();
        if let Some(n) = stats.num_boxes.get_mut(depth) {
            *n = n.saturating_sub(1);
        }
        if let Some(g) = stats.num_grid_boxes.get_mut(depth) {
            *g += 1;
        }
        let new_depth = depth + 1;
        if depth >= self.max_depth.load(Ordering::Relaxed) {
            self.max_depth.store(new_depth, Ordering::Relaxed);
            stats.reset(new_depth, num_split);
        }
        stats.num_boxes[new_depth] += num_split as u64;
    }

    /// Leaf-box counts per depth, as a snapshot.
    pub fn num_boxes(&self) -> Vec<u64> {
        self.stats_lock().num_boxes.clone()
    }

    /// Grid-box counts per depth, as a snapshot.
    pub fn num_grid_boxes(&self) -> Vec<u64> {
        self.stats_lock().num_grid_boxes.clone()
    }

    /// Theoretical maximum boxes per depth (`num_split ^ depth`).
    pub fn max_num_boxes(&self) -> Vec<f64> {
        self.stats_lock().max_boxes.clone()
    }

    pub fn total_num_boxes(&self) -> u64 {
        self.stats_lock().num_boxes.iter().sum()
    }

    pub fn total_num_grid_boxes(&self) -> u64 {
        self.stats_lock().num_grid_boxes.iter().sum()
    }

    /// Volume-weighted mean depth of the gridding.
    ///
    /// Each depth's leaf count is weighted by how much volume one of its
    /// boxes covers in units of the finest possible box, so one shallow box
    /// counts as much as the many finest boxes filling the same space. This
    /// measures how finely space is actually subdivided, unlike a naive
    /// arithmetic mean of box depths. Never panics; diagnostics stay
    /// queryable in any state.
    pub fn average_depth(&self) -> f64 {
        let stats = self.stats_lock();
        let max_finest = stats.max_boxes.last().copied().unwrap_or(1.0);
        if max_finest <= 0.0 {
            return 0.0;
        }
        let mut total = 0.0;
        for (depth, &n) in stats.num_boxes.iter().enumerate() {
            let max_at_depth = stats.max_boxes.get(depth).copied().unwrap_or(1.0);
            if max_at_depth > 0.0 {
                total += (depth as f64 * n as f64) * (max_finest / max_at_depth);
            }
        }
        total / max_finest
    }

    // ---- pending-split set -------------------------------------------------

    /// Flag a leaf box as needing a split. Thread-safe; no duplicate
    /// checking is done; re-flagging an already-flagged box is a no-op
    /// through set semantics.
    pub fn add_box_to_split(&self, box_id: u64) {
        self.pending_lock().insert(box_id);
    }

    /// Snapshot of the currently flagged boxes.
    pub fn boxes_to_split(&self) -> Vec<u64> {
        self.pending_lock().iter().copied().collect()
    }

    /// Snapshot-and-clear: swap the pending set for an empty one under the
    /// lock, so the (expensive) splitting work happens without holding it.
    /// Boxes flagged during the split pass itself land in the fresh set for
    /// the next pass.
    pub fn take_boxes_to_split(&self) -> BTreeSet<u64> {
        std::mem::take(&mut *self.pending_lock())
    }

    pub fn clear_boxes_to_split(&self) {
        self.pending_lock().clear();
    }

    /// Unflag a box. A no-op when the box is not flagged.
    pub fn remove_tracked_box(&self, box_id: u64) {
        self.pending_lock().remove(&box_id);
    }

    pub fn num_boxes_to_split(&self) -> usize {
        self.pending_lock().len()
    }

    // ---- file backing ------------------------------------------------------

    /// Attach a disk write buffer over `io`, opened at `filename`.
    ///
    /// The file length is taken from the opened store. On failure the
    /// controller stays in-memory: this is a recoverable setup-time error.
    /// Any previously attached buffer is flushed and closed first.
    pub fn set_file_backed(
        &self,
        io: Box<dyn EventIo>,
        filename: impl AsRef<Path>,
        row_len: usize,
    ) -> Result<()> {
        let path = filename.as_ref();
        let mut slot = self.buffer_lock();
        if let Some(old) = slot.take() {
            old.close()?;
        }
        let buffer = DiskBuffer::open(io, path, row_len)?;
        buffer.set_write_buffer_size(self.write_buffer_size.load(Ordering::Relaxed));
        info!(
            filename = %path.display(),
            file_length = buffer.file_length(),
            "attached file backing"
        );
        *slot = Some(Arc::new(buffer));
        Ok(())
    }

    /// Flush and close the backing file; the tree becomes in-memory only.
    pub fn clear_file_backed(&self) -> Result<()> {
        if let Some(buffer) = self.buffer_lock().take() {
            buffer.close()?;
            info!(filename = %buffer.filename().display(), "detached file backing");
        }
        Ok(())
    }

    pub fn is_file_backed(&self) -> bool {
        self.buffer_lock().is_some()
    }

    /// The disk write buffer, when file-backed.
    pub fn disk_buffer(&self) -> Option<Arc<DiskBuffer>> {
        self.buffer_lock().clone()
    }

    /// Configure the memory-caching parameters for a file-backed tree.
    ///
    /// A write buffer size of zero disables the write buffer entirely
    /// (payloads then go straight to the file when evicted).
    pub fn set_cache_parameters(
        &self,
        bytes_per_event: usize,
        write_buffer_size: u64,
    ) -> Result<()> {
        if bytes_per_event == 0 {
            return Err(Error::InvalidArgument(
                "size of an event cannot be zero".into(),
            ));
        }
        self.bytes_per_event.store(bytes_per_event, Ordering::Relaxed);
        self.use_write_buffer
            .store(write_buffer_size != 0, Ordering::Relaxed);
        self.write_buffer_size
            .store(write_buffer_size, Ordering::Relaxed);
        if let Some(buffer) = self.disk_buffer() {
            buffer.set_write_buffer_size(write_buffer_size);
        }
        Ok(())
    }

    pub fn use_write_buffer(&self) -> bool {
        self.use_write_buffer.load(Ordering::Relaxed)
    }

    pub fn bytes_per_event(&self) -> usize {
        self.bytes_per_event.load(Ordering::Relaxed)
    }

    // ---- bulk-insert batching ----------------------------------------------

    /// Parameters for slicing a bulk insert into parallel tasks:
    /// `(events_per_task, tasks_per_block)`. One block of tasks runs, joins,
    /// and is followed by a split pass before the next block starts.
    pub fn adding_events_parameters(&self) -> (usize, usize) {
        (
            self.events_per_task.load(Ordering::Relaxed),
            self.tasks_per_block.load(Ordering::Relaxed),
        )
    }

    pub fn set_events_per_task(&self, n: usize) {
        self.events_per_task.store(n.max(1), Ordering::Relaxed);
    }

    pub fn set_tasks_per_block(&self, n: usize) {
        self.tasks_per_block.store(n.max(1), Ordering::Relaxed);
    }

    // ---- serialization -----------------------------------------------------

    /// Serialize policy and statistics to the textual form accepted by
    /// [`BoxController::from_xml_str`]. File-backing state is never
    /// serialized.
    pub fn to_xml_string(&self) -> String {
        let split_into = self.split_into_lock().clone();
        let stats = self.stats_lock().clone();
        let mut out = String::from("<BoxController>\n");
        push_tag(&mut out, "NumDims", &self.nd.to_string());
        push_tag(&mut out, "MaxId", &self.max_id().to_string());
        push_tag(&mut out, "SplitThreshold", &self.split_threshold().to_string());
        push_tag(&mut out, "MaxDepth", &self.max_depth().to_string());
        push_tag(&mut out, "SplitInto", &join_values(&split_into));
        push_tag(&mut out, "NumBoxes", &join_values(&stats.num_boxes));
        push_tag(&mut out, "NumGridBoxes", &join_values(&stats.num_grid_boxes));
        out.push_str("</BoxController>\n");
        out
    }

    /// Parse a controller from its textual form.
    ///
    /// All-or-nothing: every field is extracted and validated before any
    /// controller is built, so a malformed document never yields a partially
    /// initialized controller.
    pub fn from_xml_str(xml: &str) -> Result<Self> {
        let nd: usize = parse_tag(xml, "NumDims")?;
        let max_id: u64 = parse_tag(xml, "MaxId")?;
        let split_threshold: usize = parse_tag(xml, "SplitThreshold")?;
        let max_depth: usize = parse_tag(xml, "MaxDepth")?;
        let split_into: Vec<usize> = parse_tag_vec(xml, "SplitInto")?;
        let num_boxes: Vec<u64> = parse_tag_vec(xml, "NumBoxes")?;
        let num_grid_boxes: Vec<u64> = parse_tag_vec(xml, "NumGridBoxes")?;

        if split_into.len() != nd {
            return Err(Error::Parse(format!(
                "<SplitInto> has {} entries for {nd} dimensions",
                split_into.len()
            )));
        }
        if num_boxes.len() != max_depth + 1 || num_grid_boxes.len() != max_depth + 1 {
            return Err(Error::Parse(format!(
                "per-depth vectors must have max_depth + 1 = {} entries",
                max_depth + 1
            )));
        }

        let controller = Self::new(nd);
        controller.set_max_id(max_id);
        controller.set_split_threshold(split_threshold);
        {
            let mut guard = controller.split_into_lock();
            guard.copy_from_slice(&split_into);
        }
        controller.recalc_num_split();
        controller.set_max_depth(max_depth);
        {
            let mut stats = controller.stats_lock();
            stats.num_boxes = num_boxes;
            stats.num_grid_boxes = num_grid_boxes;
        }
        Ok(controller)
    }
}

/// Deep value comparison over policy and statistics. File-backing state is
/// deliberately excluded: two controllers that differ only in their backing
/// file compare equal.
impl PartialEq for BoxController {
    fn eq(&self, other: &Self) -> bool {
        self.nd == other.nd
            && self.max_id() == other.max_id()
            && self.split_threshold() == other.split_threshold()
            && self.max_depth() == other.max_depth()
            && self.num_split() == other.num_split()
            && *self.split_into_lock() == *other.split_into_lock()
            && *self.stats_lock() == *other.stats_lock()
    }
}

/// A clone always starts non-file-backed, even when the source is
/// file-backed: cloned trees must never share a file handle.
impl Clone for BoxController {
    fn clone(&self) -> Self {
        let clone = Self::new(self.nd);
        clone.set_max_id(self.max_id());
        clone.set_split_threshold(self.split_threshold());
        {
            let mut guard = clone.split_into_lock();
            guard.copy_from_slice(&self.split_into_lock());
        }
        clone.recalc_num_split();
        clone.set_max_depth(self.max_depth());
        *clone.stats_lock() = self.stats_lock().clone();
        clone
            .use_write_buffer
            .store(self.use_write_buffer(), Ordering::Relaxed);
        clone
            .write_buffer_size
            .store(self.write_buffer_size.load(Ordering::Relaxed), Ordering::Relaxed);
        clone
            .bytes_per_event
            .store(self.bytes_per_event(), Ordering::Relaxed);
        let (ept, tpb) = self.adding_events_parameters();
        clone.set_events_per_task(ept);
        clone.set_tasks_per_block(tpb);
        clone
    }
}

fn push_tag(out: &mut String, tag: &str, value: &str) {
    out.push_str("  <");
    out.push_str(tag);
    out.push('>');
    out.push_str(value);
    out.push_str("</");
    out.push_str(tag);
    out.push_str(">\n");
}

fn join_values<T: std::fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn tag_content<'a>(xml: &'a str, tag: &str) -> Result<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml
        .find(&open)
        .ok_or_else(|| Error::Parse(format!("missing <{tag}>")))?
        + open.len();
    let len = xml[start..]
        .find(&close)
        .ok_or_else(|| Error::Parse(format!("missing </{tag}>")))?;
    Ok(&xml[start..start + len])
}

fn parse_tag<T: std::str::FromStr>(xml: &str, tag: &str) -> Result<T> {
    let content = tag_content(xml, tag)?;
    content
        .trim()
        .parse()
        .map_err(|_| Error::Parse(format!("invalid value {:?} in <{tag}>", content.trim())))
}

fn parse_tag_vec<T: std::str::FromStr>(xml: &str, tag: &str) -> Result<Vec<T>> {
    let content = tag_content(xml, tag)?;
    content
        .split_whitespace()
        .map(|v| {
            v.parse()
                .map_err(|_| Error::Parse(format!("invalid value {v:?} in <{tag}>")))
        })
        .collect()
}
