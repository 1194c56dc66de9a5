use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

const MARKER_MODE: u32 = 0o644;
/// Attempts to re-open a marker that was unlinked by its previous owner between our open and lock.
const RELINK_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another instance already holds {}", path.display())]
    AlreadyRunning { path: PathBuf },
    #[error("unable to lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive ownership of the pid marker. The marker is removed when the guard drops.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    // Held only for its lock; released after the marker is unlinked.
    _lock: Flock<File>,
}

impl LockFile {
    /// Take the marker without blocking and record our pid in it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source: io::Error| LockError::Io {
            path: path.clone(),
            source,
        };

        let mut attempt = 0;
        let mut lock = loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .mode(MARKER_MODE)
                .open(&path)
                .map_err(io_err)?;

            let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => lock,
                Err((_, Errno::EWOULDBLOCK)) => {
                    return Err(LockError::AlreadyRunning { path: path.clone() });
                }
                Err((_, errno)) => return Err(io_err(io::Error::from(errno))),
            };

            // The previous owner unlinks the marker while still holding it, so the inode we
            // locked may no longer be the one at `path`.
            if still_linked(&lock, &path).map_err(io_err)? {
                break lock;
            }
            attempt += 1;
            if attempt == RELINK_ATTEMPTS {
                return Err(LockError::AlreadyRunning { path: path.clone() });
            }
        };

        lock.set_len(0).map_err(io_err)?;
        writeln!(lock, "{}", std::process::id()).map_err(io_err)?;
        lock.flush().map_err(io_err)?;

        tracing::debug!(path = %path.display(), "acquired singleton lock");
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether `file` is still the inode that `path` names.
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "unable to remove lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_pid_and_removes_marker_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camsrvd.pid");
        std::fs::write(&path, "stale contents that are longer than a pid\n").unwrap();

        let guard = LockFile::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, format!("{}\n", std::process::id()));
        assert_eq!(guard.path(), path);

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn second_holder_is_refused_and_marker_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camsrvd.pid");
        let first = LockFile::acquire(&path).unwrap();

        let err = LockFile::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { .. }), "{err}");
        assert!(path.exists());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("{}\n", std::process::id())
        );

        drop(first);
        let again = LockFile::acquire(&path).unwrap();
        drop(again);
    }

    #[test]
    fn marker_is_not_group_or_world_writable() {
        use nix::sys::stat::{Mode, umask};
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camsrvd.pid");
        // The daemon clears its umask before taking the lock.
        let previous = umask(Mode::empty());
        let guard = LockFile::acquire(&path);
        umask(previous);

        let guard = guard.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
        drop(guard);
    }

    #[test]
    fn replaced_marker_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camsrvd.pid");
        let held = File::create(&path).unwrap();
        assert!(still_linked(&held, &path).unwrap());

        std::fs::remove_file(&path).unwrap();
        assert!(!still_linked(&held, &path).unwrap());

        std::fs::write(&path, b"4242\n").unwrap();
        assert!(!still_linked(&held, &path).unwrap());
    }

    #[test]
    fn unusable_location_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("camsrvd.pid");
        let err = LockFile::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Io { .. }), "{err}");
    }
}
