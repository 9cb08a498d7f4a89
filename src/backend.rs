//! The capability boundary between the protocol engine and storage.
//!
//! A [`BackendFactory`] hands out one [`Backend`] per accepted connection;
//! the backend is private to its session and is closed exactly once when
//! the session ends, whichever way it ends. No protocol concern crosses
//! this boundary: backends report [`OptError`] for export lookup failures
//! and [`ErrorType`] for block I/O failures, and the engine does the rest.

use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::unix::prelude::FileExt;
use std::sync::Arc;

use crate::proto::{ErrorType, OptError};

/// Description of an export, as negotiated during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    pub name: String,
    pub description: String,
    /// Size of the export in bytes.
    pub size: u64,
    /// Advertised as minimum, preferred, and maximum block size alike.
    pub block_size: u32,
}

/// A block device bound to one session.
pub trait Backend {
    /// Look up the export a client asked for. `export` is the name from
    /// the client's `INFO`/`GO` option (often empty, meaning the default).
    fn info(&self, export: &str) -> Result<ExportInfo, OptError>;

    /// Names of the exports this backend offers. Unused until `OPT_LIST`
    /// is implemented.
    fn export_list(&self) -> Result<Vec<String>, OptError> {
        Err(OptError::UNSUP)
    }

    /// Read exactly `len` bytes starting at `off`.
    fn read(&mut self, off: u64, len: u32) -> Result<Vec<u8>, ErrorType>;

    /// Write all of `data` starting at `off`.
    fn write(&mut self, off: u64, data: &[u8]) -> Result<(), ErrorType>;

    /// Flush outstanding writes to stable storage.
    fn flush(&mut self) -> Result<(), ErrorType>;

    /// Called exactly once when the session ends, on every exit path.
    fn close(&mut self) {}
}

/// Hands out a backend per accepted connection. Shared across the accept
/// loop and therefore must tolerate concurrent calls.
pub trait BackendFactory {
    type Backend: Backend;

    fn new_client(&self, remote_addr: SocketAddr) -> Self::Backend;
}

fn lookup(info: &ExportInfo, export: &str) -> Result<ExportInfo, OptError> {
    // an empty name selects the default (only) export
    if export.is_empty() || export == info.name {
        Ok(info.clone())
    } else {
        Err(OptError::UNKNOWN)
    }
}

/// In-memory backend: a zeroed buffer, private to the session.
#[derive(Debug)]
pub struct MemBackend {
    info: ExportInfo,
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new(info: ExportInfo) -> Self {
        let size = info.size as usize;
        Self {
            info,
            data: vec![0u8; size],
        }
    }

    fn range(&self, off: u64, len: usize) -> Result<std::ops::Range<usize>, ErrorType> {
        let off = off as usize;
        match off.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(off..end),
            _ => Err(ErrorType::EOVERFLOW),
        }
    }
}

impl Backend for MemBackend {
    fn info(&self, export: &str) -> Result<ExportInfo, OptError> {
        lookup(&self.info, export)
    }

    fn read(&mut self, off: u64, len: u32) -> Result<Vec<u8>, ErrorType> {
        let range = self.range(off, len as usize)?;
        Ok(self.data[range].to_vec())
    }

    fn write(&mut self, off: u64, data: &[u8]) -> Result<(), ErrorType> {
        let range = self.range(off, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ErrorType> {
        Ok(())
    }

    fn close(&mut self) {
        self.data = vec![];
    }
}

/// Factory for [`MemBackend`]. Every connection gets its own fresh buffer;
/// there is no coherence between sessions.
#[derive(Debug)]
pub struct MemBackendFactory {
    info: ExportInfo,
}

impl MemBackendFactory {
    pub fn new(info: ExportInfo) -> Self {
        Self { info }
    }
}

impl BackendFactory for MemBackendFactory {
    type Backend = MemBackend;

    fn new_client(&self, _remote_addr: SocketAddr) -> MemBackend {
        MemBackend::new(self.info.clone())
    }
}

/// File-backed backend using positional reads and writes, so concurrent
/// sessions can share the underlying file without a seek cursor.
#[derive(Debug)]
pub struct FileBackend {
    info: ExportInfo,
    file: Arc<File>,
}

impl Backend for FileBackend {
    fn info(&self, export: &str) -> Result<ExportInfo, OptError> {
        lookup(&self.info, export)
    }

    fn read(&mut self, off: u64, len: u32) -> Result<Vec<u8>, ErrorType> {
        let mut buf = vec![0u8; len as usize];
        self.file
            .read_exact_at(&mut buf, off)
            .map_err(|err| ErrorType::from_io_kind(err.kind()))?;
        Ok(buf)
    }

    fn write(&mut self, off: u64, data: &[u8]) -> Result<(), ErrorType> {
        self.file
            .write_all_at(data, off)
            .map_err(|err| ErrorType::from_io_kind(err.kind()))
    }

    fn flush(&mut self) -> Result<(), ErrorType> {
        self.file
            .sync_data()
            .map_err(|err| ErrorType::from_io_kind(err.kind()))
    }
}

/// Factory for [`FileBackend`]. All sessions share the same file.
#[derive(Debug)]
pub struct FileBackendFactory {
    info: ExportInfo,
    file: Arc<File>,
}

impl FileBackendFactory {
    /// Export `file` under `name`. The export size is the file's current
    /// length.
    pub fn new(file: File, name: String, description: String, block_size: u32) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            info: ExportInfo {
                name,
                description,
                size,
                block_size,
            },
            file: Arc::new(file),
        })
    }
}

impl BackendFactory for FileBackendFactory {
    type Backend = FileBackend;

    fn new_client(&self, _remote_addr: SocketAddr) -> FileBackend {
        FileBackend {
            info: self.info.clone(),
            file: Arc::clone(&self.file),
        }
    }
}
