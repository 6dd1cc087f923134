//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A volatile storage backend.
///
/// Used by in-memory stores and by tests. Writes can be made to fail on
/// demand through a [`WriteFailureSwitch`], which simulates an unavailable
/// medium without touching the file system.
///
/// # Example
///
/// ```rust
/// use docsync_storage::{InMemoryBackend, StorageBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let switch = backend.failure_switch();
///
/// switch.set(true);
/// assert!(backend.append(b"lost").is_err());
///
/// switch.set(false);
/// assert_eq!(backend.append(b"kept").unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Vec<u8>>,
    fail_writes: WriteFailureSwitch,
}

/// Shared toggle that makes an [`InMemoryBackend`] reject writes.
#[derive(Debug, Clone, Default)]
pub struct WriteFailureSwitch(Arc<AtomicBool>);

impl WriteFailureSwitch {
    /// Turns write failures on or off.
    pub fn set(&self, failing: bool) {
        self.0.store(failing, Ordering::SeqCst);
    }

    /// Returns true while writes are being rejected.
    #[must_use]
    pub fn is_failing(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl InMemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding `data`, for recovery tests.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            fail_writes: WriteFailureSwitch::default(),
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Returns the switch controlling injected write failures.
    #[must_use]
    pub fn failure_switch(&self) -> WriteFailureSwitch {
        self.fail_writes.clone()
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.is_failing() {
            return Err(StorageError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);
        if offset > size || end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(data[start..end].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        self.check_writable()?;
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.check_writable()
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check_writable()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }
}
