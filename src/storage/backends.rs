//! Persistence backends.
//!
//! Two tiers back the persisted runtime state: a fast always-on memory
//! region that survives deep sleep but not a cold boot, and a slow
//! non-volatile single-blob store. Both are modelled by the same trait so
//! the composer and the tests can mix them freely.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::core::{Error, Result};

/// A fixed-size blob store.
///
/// `load` fills the caller's buffer completely or fails; a stored blob of a
/// different size is treated as absent data.
pub trait PersistenceBackend: Send + Sync {
    /// Reads the stored blob into `buf`.
    fn load(&self, buf: &mut [u8]) -> Result<()>;

    /// Replaces the stored blob with `buf`.
    fn save(&self, buf: &[u8]) -> Result<()>;
}

/// Fast tier: an in-process byte region.
///
/// Clones share the region, mirroring memory that outlives the runtime
/// object but not the process.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    region: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryBackend {
    /// Creates an empty region.
    pub fn new() -> Self {
        MemoryBackend {
            region: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceBackend for MemoryBackend {
    fn load(&self, buf: &mut [u8]) -> Result<()> {
        let region = self.region.lock().expect("memory region lock poisoned");
        match region.as_ref() {
            Some(stored) if stored.len() == buf.len() => {
                buf.copy_from_slice(stored);
                Ok(())
            }
            Some(stored) => Err(Error::storage(format!(
                "stored blob is {} bytes, expected {}",
                stored.len(),
                buf.len()
            ))),
            None => Err(Error::storage("memory region is empty")),
        }
    }

    fn save(&self, buf: &[u8]) -> Result<()> {
        let mut region = self.region.lock().expect("memory region lock poisoned");
        *region = Some(buf.to_vec());
        Ok(())
    }
}

/// Slow tier: a single blob under a fixed path.
///
/// Saves go through a temporary file and a rename so a crash mid-write
/// leaves the previous blob intact.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    /// Creates a backend storing its blob at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileBackend { path: path.into() }
    }
}

impl PersistenceBackend for FileBackend {
    fn load(&self, buf: &mut [u8]) -> Result<()> {
        let stored = fs::read(&self.path)?;
        if stored.len() != buf.len() {
            return Err(Error::storage(format!(
                "stored blob is {} bytes, expected {}",
                stored.len(),
                buf.len()
            )));
        }
        buf.copy_from_slice(&stored);
        Ok(())
    }

    fn save(&self, buf: &[u8]) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, buf)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
