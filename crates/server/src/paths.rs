//! Path resolution for daemon data files.
//!
//! Resolved once at startup from: CLI `--data-dir` / `OPTAD_DATA_DIR` > `~/.opta/daemon`.
//! Everything the daemon writes lives under this root.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Resolve the data directory. `explicit` already folds in the env var via clap.
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let root = match explicit {
            Some(path) => path.to_path_buf(),
            None => dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("HOME directory not found; pass --data-dir"))?
                .join(".opta")
                .join("daemon"),
        };
        Ok(Self { root })
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("daemon.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("optad.pid")
    }

    /// Written on startup so local clients can find the daemon.
    pub fn state_file(&self) -> PathBuf {
        self.root.join("daemon.json")
    }

    pub fn encryption_key(&self) -> PathBuf {
        self.root.join("encryption.key")
    }

    /// Create all required subdirectories under the data dir.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}
