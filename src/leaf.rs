use std::sync::{Mutex, MutexGuard};

use crate::bounds::Extents;
use crate::controller::BoxController;
use crate::error::{Error, Result};
use crate::event::{Event, events_from_rows, events_to_rows};

/// Where a leaf's events currently live.
enum Payload<E> {
    InMemory(Vec<E>),
    /// Evicted through the disk buffer; only the population survives in
    /// memory. The buffer keeps the file offset.
    OnDisk { n_events: u64 },
}

struct Inner<E> {
    payload: Payload<E>,
    signal_total: f64,
    error_squared_total: f64,
}

/// A terminal node of the box tree: a bounded collection of events, possibly
/// evicted to the backing file.
///
/// Event storage sits behind the leaf's own data mutex so that parallel
/// insertion workers can append into different leaves concurrently while the
/// tree structure itself stays immutable (`&self`). The leaf never splits
/// itself: when its population crosses the controller's threshold it only
/// flags its ID in the pending-split set.
pub struct LeafBox<E, const ND: usize> {
    id: u64,
    depth: usize,
    extents: Extents<ND>,
    inner: Mutex<Inner<E>>,
}

impl<E: Event<ND>, const ND: usize> LeafBox<E, ND> {
    pub fn new(id: u64, depth: usize, extents: Extents<ND>) -> Self {
        Self {
            id,
            depth,
            extents,
            inner: Mutex::new(Inner {
                payload: Payload::InMemory(Vec::new()),
                signal_total: 0.0,
                error_squared_total: 0.0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<E>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn extents(&self) -> &Extents<ND> {
        &self.extents
    }

    pub fn n_points(&self) -> u64 {
        match &self.lock().payload {
            Payload::InMemory(events) => events.len() as u64,
            Payload::OnDisk { n_events } => *n_events,
        }
    }

    pub fn signal_total(&self) -> f64 {
        self.lock().signal_total
    }

    pub fn error_squared_total(&self) -> f64 {
        self.lock().error_squared_total
    }

    pub fn is_on_disk(&self) -> bool {
        matches!(self.lock().payload, Payload::OnDisk { .. })
    }

    /// Append one event.
    ///
    /// An evicted payload is first pulled back from the disk buffer and the
    /// buffer's now-stale copy is dropped (a runtime load failure
    /// propagates). When the resulting population
    /// satisfies the controller's split policy the leaf flags itself for the
    /// next split pass; the split itself never happens on this call stack.
    pub fn add_event(&self, controller: &BoxController, event: E) -> Result<()> {
        let n = {
            let mut inner = self.lock();
            if let Payload::OnDisk { .. } = inner.payload {
                inner.payload = Payload::InMemory(self.load_events(controller)?);
                self.forget_in_buffer(controller);
            }
            inner.signal_total += event.signal();
            inner.error_squared_total += event.error_squared();
            match &mut inner.payload {
                Payload::InMemory(events) => {
                    events.push(event);
                    events.len()
                }
                Payload::OnDisk { .. } => unreachable!("payload made resident above"),
            }
        };
        if controller.will_split(n, self.depth) {
            controller.add_box_to_split(self.id);
        }
        Ok(())
    }

    /// Evict this leaf's payload through the controller's disk buffer,
    /// keeping only the population count in memory. A no-op for an empty or
    /// already-evicted leaf.
    pub fn stage_to_disk(&self, controller: &BoxController) -> Result<()> {
        let buffer = controller.disk_buffer().ok_or_else(|| {
            Error::Logic("stage_to_disk called on a tree that is not file-backed".into())
        })?;
        let mut inner = self.lock();
        let events = match &mut inner.payload {
            Payload::InMemory(events) if !events.is_empty() => std::mem::take(events),
            _ => return Ok(()),
        };
        let n_events = events.len() as u64;
        buffer.stage(self.id, n_events, events_to_rows(&events))?;
        if !controller.use_write_buffer() {
            buffer.flush()?;
        }
        inner.payload = Payload::OnDisk { n_events };
        Ok(())
    }

    /// Take ownership of every event in this leaf, loading from the disk
    /// buffer when evicted. Used by the split pass when redistributing into
    /// the new children.
    pub fn take_events(&self, controller: &BoxController) -> Result<Vec<E>> {
        let mut inner = self.lock();
        match &mut inner.payload {
            Payload::InMemory(events) => Ok(std::mem::take(events)),
            Payload::OnDisk { .. } => {
                let events = self.load_events(controller)?;
                self.forget_in_buffer(controller);
                inner.payload = Payload::InMemory(Vec::new());
                Ok(events)
            }
        }
    }

    /// Drop the buffer's copy of this leaf's payload. Without this a
    /// restored payload would keep counting against the flush budget and a
    /// later flush would write the outdated copy to the file.
    fn forget_in_buffer(&self, controller: &BoxController) {
        if let Some(buffer) = controller.disk_buffer() {
            buffer.forget(self.id);
        }
    }

    fn load_events(&self, controller: &BoxController) -> Result<Vec<E>> {
        let buffer = controller.disk_buffer().ok_or_else(|| {
            Error::Logic(format!(
                "box {} has an evicted payload but no disk buffer is attached",
                self.id
            ))
        })?;
        let (_n_events, rows) = buffer.load(self.id)?;
        Ok(events_from_rows(&rows))
    }
}

impl<E, const ND: usize> std::fmt::Debug for LeafBox<E, ND> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafBox")
            .field("id", &self.id)
            .field("depth", &self.depth)
            .field("extents", &self.extents)
            .finish_non_exhaustive()
    }
}
