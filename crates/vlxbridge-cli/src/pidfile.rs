//! Single-instance guard.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

/// A PID file created exclusively and removed again on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Fails if `path` already exists: another instance is running or a
    /// previous one did not shut down cleanly.
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                bail!(
                    "PID file {} already exists; is another instance running?",
                    path.display()
                )
            }
            Err(e) => {
                return Err(e).with_context(|| format!("creating PID file {}", path.display()));
            }
        };
        let pidfile = Self {
            path: path.to_path_buf(),
        };
        writeln!(file, "{}", std::process::id())
            .with_context(|| format!("writing PID file {}", path.display()))?;
        debug!(path = %path.display(), "PID file created");
        Ok(pidfile)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove PID file");
        }
    }
}
