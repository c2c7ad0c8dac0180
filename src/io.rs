use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Random-access event file consumed by the disk buffer.
///
/// Offsets and lengths are expressed in events; one event is `row_len`
/// little-endian `f64` values. The handle is single-writer: the disk buffer
/// owns it exclusively and serializes all access, so implementations do not
/// need their own locking.
pub trait EventIo: Send {
    /// Open (creating if needed) the backing store at `path`.
    fn open(&mut self, path: &Path) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Values of `f64` per event; must be set before any read or write.
    fn set_row_len(&mut self, row_len: usize);

    /// Current length of the store, in events.
    fn file_length(&self) -> u64;

    /// Write `n_events` events (`rows.len() == n_events * row_len`) starting
    /// at event offset `offset`. Extends the store when writing past the end.
    fn write(&mut self, offset: u64, n_events: u64, rows: &[f64]) -> Result<()>;

    /// Read `n_events` events starting at event offset `offset`.
    fn read(&mut self, offset: u64, n_events: u64) -> Result<Vec<f64>>;

    fn close(&mut self) -> Result<()>;
}

/// Flat binary event file over `std::fs::File`.
///
/// The layout is exactly the disk rows, nothing else: no header, no framing.
/// The position table that maps boxes to offsets lives in the disk buffer,
/// not in the file.
#[derive(Debug, Default)]
pub struct FileEventIo {
    file: Option<File>,
    path: PathBuf,
    row_len: usize,
}

impl FileEventIo {
    pub fn new() -> Self {
        Self::default()
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::Logic("event file used before open".into()))
    }

    fn byte_offset(&self, offset: u64) -> u64 {
        offset * self.row_len as u64 * 8
    }
}

impl EventIo for FileEventIo {
    fn open(&mut self, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io(format!("opening event file {}", path.display()), e))?;
        self.file = Some(file);
        self.path = path.to_path_buf();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn set_row_len(&mut self, row_len: usize) {
        self.row_len = row_len;
    }

    fn file_length(&self) -> u64 {
        let row_bytes = (self.row_len * 8) as u64;
        if row_bytes == 0 {
            return 0;
        }
        match &self.file {
            Some(f) => f.metadata().map(|m| m.len() / row_bytes).unwrap_or(0),
            None => 0,
        }
    }

    fn write(&mut self, offset: u64, n_events: u64, rows: &[f64]) -> Result<()> {
        debug_assert_eq!(rows.len() as u64, n_events * self.row_len as u64);
        let pos = self.byte_offset(offset);
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| Error::io("seeking event file for write", e))?;
        let mut bytes = Vec::with_capacity(rows.len() * 8);
        for v in rows {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        file.write_all(&bytes)
            .map_err(|e| Error::io("writing event block", e))?;
        Ok(())
    }

    fn read(&mut self, offset: u64, n_events: u64) -> Result<Vec<f64>> {
        let pos = self.byte_offset(offset);
        let n_values = n_events as usize * self.row_len;
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| Error::io("seeking event file for read", e))?;
        let mut bytes = vec![0_u8; n_values * 8];
        file.read_exact(&mut bytes)
            .map_err(|e| Error::io("reading event block", e))?;
        let rows = bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        Ok(rows)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()
                .map_err(|e| Error::io("syncing event file on close", e))?;
        }
        Ok(())
    }
}

/// In-memory backing store, primarily a test double for file-backed trees.
///
/// Behaves like `FileEventIo` over a growable vector, so tests can exercise
/// eviction and read-back without touching the filesystem.
#[derive(Debug, Default)]
pub struct MemoryEventIo {
    values: Vec<f64>,
    open: bool,
    row_len: usize,
}

impl MemoryEventIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load store contents, simulating an existing file.
    pub fn with_values(values: Vec<f64>, row_len: usize) -> Self {
        Self {
            values,
            open: false,
            row_len,
        }
    }
}

/// Wrapper that keeps an outside handle onto an `EventIo` given away to a
/// controller, so callers (tests, diagnostics) can still observe it.
#[derive(Debug, Default)]
pub struct SharedEventIo<T>(std::sync::Arc<std::sync::Mutex<T>>);

impl<T: EventIo> SharedEventIo<T> {
    pub fn new(inner: T) -> Self {
        Self(std::sync::Arc::new(std::sync::Mutex::new(inner)))
    }

    pub fn handle(&self) -> Self {
        Self(self.0.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        // A panic while holding the inner lock already poisoned the store;
        // there is nothing more coherent to do than propagate it.
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: EventIo> EventIo for SharedEventIo<T> {
    fn open(&mut self, path: &Path) -> Result<()> {
        self.lock().open(path)
    }

    fn is_open(&self) -> bool {
        self.lock().is_open()
    }

    fn set_row_len(&mut self, row_len: usize) {
        self.lock().set_row_len(row_len);
    }

    fn file_length(&self) -> u64 {
        self.lock().file_length()
    }

    fn write(&mut self, offset: u64, n_events: u64, rows: &[f64]) -> Result<()> {
        self.lock().write(offset, n_events, rows)
    }

    fn read(&mut self, offset: u64, n_events: u64) -> Result<Vec<f64>> {
        self.lock().read(offset, n_events)
    }

    fn close(&mut self) -> Result<()> {
        self.lock().close()
    }
}

impl EventIo for MemoryEventIo {
    fn open(&mut self, _path: &Path) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn set_row_len(&mut self, row_len: usize) {
        self.row_len = row_len;
    }

    fn file_length(&self) -> u64 {
        if self.row_len == 0 {
            0
        } else {
            (self.values.len() / self.row_len) as u64
        }
    }

    fn write(&mut self, offset: u64, n_events: u64, rows: &[f64]) -> Result<()> {
        debug_assert_eq!(rows.len() as u64, n_events * self.row_len as u64);
        let start = offset as usize * self.row_len;
        let end = start + rows.len();
        if self.values.len() < end {
            self.values.resize(end, 0.0);
        }
        self.values[start..end].copy_from_slice(rows);
        Ok(())
    }

    fn read(&mut self, offset: u64, n_events: u64) -> Result<Vec<f64>> {
        let start = offset as usize * self.row_len;
        let end = start + n_events as usize * self.row_len;
        if end > self.values.len() {
            return Err(Error::Logic(format!(
                "read past end of memory store ({} > {})",
                end,
                self.values.len()
            )));
        }
        Ok(self.values[start..end].to_vec())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}
