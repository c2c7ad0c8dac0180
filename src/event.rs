/// A point-like record stored in the box tree: a signal value with an
/// N-dimensional position.
///
/// Events are immutable once created and exclusively owned by whichever leaf
/// box currently holds them. The trait also defines the flat `f64` row layout
/// used when a payload is evicted to the backing file, so the disk buffer can
/// stay untyped.
pub trait Event<const ND: usize>: Clone + Send + Sync {
    /// Number of `f64` values one event occupies on disk.
    const ROW_LEN: usize;

    fn signal(&self) -> f64;
    fn error_squared(&self) -> f64;
    fn coords(&self) -> &[f32; ND];

    /// Append this event's disk row to `out` (exactly `ROW_LEN` values).
    fn write_row(&self, out: &mut Vec<f64>);

    /// Rebuild an event from one disk row (`row.len() == ROW_LEN`).
    fn from_row(row: &[f64]) -> Self;
}

/// The lean event variant: signal, squared error and coordinates only.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LeanEvent<const ND: usize> {
    pub signal: f64,
    pub error_squared: f64,
    pub coords: [f32; ND],
}

impl<const ND: usize> LeanEvent<ND> {
    pub fn new(signal: f64, error_squared: f64, coords: [f32; ND]) -> Self {
        Self {
            signal,
            error_squared,
            coords,
        }
    }
}

impl<const ND: usize> Event<ND> for LeanEvent<ND> {
    const ROW_LEN: usize = ND + 2;

    fn signal(&self) -> f64 {
        self.signal
    }

    fn error_squared(&self) -> f64 {
        self.error_squared
    }

    fn coords(&self) -> &[f32; ND] {
        &self.coords
    }

    fn write_row(&self, out: &mut Vec<f64>) {
        out.push(self.signal);
        out.push(self.error_squared);
        for d in 0..ND {
            out.push(f64::from(self.coords[d]));
        }
    }

    fn from_row(row: &[f64]) -> Self {
        let mut coords = [0.0_f32; ND];
        for d in 0..ND {
            coords[d] = row[2 + d] as f32;
        }
        Self {
            signal: row[0],
            error_squared: row[1],
            coords,
        }
    }
}

/// The fat event variant: adds run and detector provenance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FullEvent<const ND: usize> {
    pub signal: f64,
    pub error_squared: f64,
    pub run_index: u16,
    pub detector_id: i32,
    pub coords: [f32; ND],
}

impl<const ND: usize> FullEvent<ND> {
    pub fn new(
        signal: f64,
        error_squared: f64,
        run_index: u16,
        detector_id: i32,
        coords: [f32; ND],
    ) -> Self {
        Self {
            signal,
            error_squared,
            run_index,
            detector_id,
            coords,
        }
    }
}

impl<const ND: usize> Event<ND> for FullEvent<ND> {
    const ROW_LEN: usize = ND + 4;

    fn signal(&self) -> f64 {
        self.signal
    }

    fn error_squared(&self) -> f64 {
        self.error_squared
    }

    fn coords(&self) -> &[f32; ND] {
        &self.coords
    }

    fn write_row(&self, out: &mut Vec<f64>) {
        out.push(self.signal);
        out.push(self.error_squared);
        out.push(f64::from(self.run_index));
        out.push(f64::from(self.detector_id));
        for d in 0..ND {
            out.push(f64::from(self.coords[d]));
        }
    }

    fn from_row(row: &[f64]) -> Self {
        let mut coords = [0.0_f32; ND];
        for d in 0..ND {
            coords[d] = row[4 + d] as f32;
        }
        Self {
            signal: row[0],
            error_squared: row[1],
            run_index: row[2] as u16,
            detector_id: row[3] as i32,
            coords,
        }
    }
}

/// Serialize a batch of events into one contiguous disk payload.
pub(crate) fn events_to_rows<E: Event<ND>, const ND: usize>(events: &[E]) -> Vec<f64> {
    let mut rows = Vec::with_capacity(events.len() * E::ROW_LEN);
    for e in events {
        e.write_row(&mut rows);
    }
    rows
}

/// Rebuild a batch of events from a contiguous disk payload.
pub(crate) fn events_from_rows<E: Event<ND>, const ND: usize>(rows: &[f64]) -> Vec<E> {
    rows.chunks_exact(E::ROW_LEN).map(E::from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lean_event_row_round_trip() {
        let e = LeanEvent::new(2.5, 0.25, [1.0_f32, -3.0, 7.5]);
        let mut rows = Vec::new();
        e.write_row(&mut rows);
        assert_eq!(rows.len(), LeanEvent::<3>::ROW_LEN);
        assert_eq!(LeanEvent::<3>::from_row(&rows), e);
    }

    #[test]
    fn test_full_event_row_round_trip() {
        let e = FullEvent::new(1.0, 1.0, 42, -7, [0.5_f32, 0.25]);
        let mut rows = Vec::new();
        e.write_row(&mut rows);
        assert_eq!(rows.len(), FullEvent::<2>::ROW_LEN);
        assert_eq!(FullEvent::<2>::from_row(&rows), e);
    }

    #[test]
    fn test_batch_round_trip() {
        let events: Vec<LeanEvent<2>> = (0..10)
            .map(|i| LeanEvent::new(i as f64, 1.0, [i as f32, -(i as f32)]))
            .collect();
        let rows = events_to_rows(&events);
        let back: Vec<LeanEvent<2>> = events_from_rows(&rows);
        assert_eq!(back, events);
    }
}
