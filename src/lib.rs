//! # mdboxtree
//!
//! `mdboxtree` is a Rust library for storing large, unordered streams of
//! multi-dimensional events (point-like records with a signal and a position
//! in N dimensions) in a recursive spatial box tree. Dense regions split
//! adaptively into grids of sub-boxes, insertion runs in parallel across
//! worker threads, and event sets larger than memory can be spilled to a
//! backing file through a bounded disk write buffer.
//!
//! ## Features
//!
//! - **Adaptive splitting**: leaf boxes that grow past a configurable
//!   threshold are flagged and converted into grids in deferred, batched
//!   split passes, with a configurable per-dimension fan-out and depth
//!   ceiling.
//! - **Parallel insertion**: bulk inserts are sliced into rayon tasks;
//!   insertion and splitting alternate as phases, so the structure needs no
//!   tree-wide lock.
//! - **Disk-backed storage**: an optional write buffer stages evicted leaf
//!   payloads in memory and flushes them to a single backing file when its
//!   event budget is exceeded.
//! - **Diagnostics**: per-depth box population statistics, a volume-weighted
//!   average gridding depth, and a round-trippable textual form of the
//!   controller state.
//!
//! ## Main Interface
//!
//! [`EventTree`] owns the root box and drives insertion and splitting;
//! [`BoxController`] is the shared policy and bookkeeping hub every box in a
//! tree consults.

mod bounds;
mod controller;
mod diskbuffer;
mod error;
mod event;
mod grid;
mod io;
mod leaf;
mod progress;
mod tree;

pub use bounds::Extents;
pub use controller::BoxController;
pub use diskbuffer::{DiskBuffer, DiskPosition};
pub use error::{Error, Result};
pub use event::{Event, FullEvent, LeanEvent};
pub use grid::{BoxNode, GridBox};
pub use io::{EventIo, FileEventIo, MemoryEventIo, SharedEventIo};
pub use leaf::LeafBox;
pub use progress::{CancelAfter, NullProgress, ProgressReporter};
pub use tree::{BulkAddOutcome, EventTree, LeafIter};
