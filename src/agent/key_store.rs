//! Storage for the long-lived access key the agent may grant.
//!
//! Failures here are never fatal to a connection attempt: the negotiator logs
//! them and carries on without a remembered key.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

pub trait KeyStore: Send + Sync {
    /// Returns the remembered key, if any. An error means storage is unusable.
    fn load(&self) -> Result<Option<String>>;

    fn store(&self, key: &str) -> Result<()>;
}

/// Keeps the key in a single owner-only file.
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                let key = raw.trim();
                Ok((!key.is_empty()).then(|| key.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read access key from {}", self.path.display())),
        }
    }

    fn store(&self, key: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(key.as_bytes())
            .with_context(|| format!("Failed to write access key to {}", self.path.display()))?;
        Ok(())
    }
}

/// In-process store, handy for embedding and tests.
#[derive(Default)]
pub struct MemoryKeyStore {
    key: Mutex<Option<String>>,
}

impl MemoryKeyStore {
    pub fn new(initial: Option<String>) -> Self {
        Self {
            key: Mutex::new(initial),
        }
    }

    pub fn current(&self) -> Option<String> {
        self.key.lock().clone()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.current())
    }

    fn store(&self, key: &str) -> Result<()> {
        *self.key.lock() = Some(key.to_string());
        Ok(())
    }
}
