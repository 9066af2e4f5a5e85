//! Single daemon per data directory: an exclusive `flock` on `<dir>/.lock`

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

pub const LOCK_FILE: &str = ".lock";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("daemon already running (lock held on {})", .0.display())]
    Held(PathBuf),

    #[error("lock file {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Held for the daemon's lifetime. The file contains our PID.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    pub fn acquire(dir: &Path) -> Result<Self, LockError> {
        let path = dir.join(LOCK_FILE);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&path).map_err(io_err)?;

        if file.try_lock_exclusive().is_err() {
            return Err(LockError::Held(path));
        }

        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock, close and remove the lock file. Every step is attempted;
    /// the errors are returned together.
    pub fn release(self) -> Result<(), Vec<io::Error>> {
        let mut errors = Vec::new();
        if let Err(e) = FileExt::unlock(&self.file) {
            errors.push(e);
        }
        drop(self.file);
        if let Err(e) = std::fs::remove_file(&self.path) {
            errors.push(e);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
