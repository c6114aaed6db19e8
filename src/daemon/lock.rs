//! Cross-process singleton lock for the daemon.
//!
//! At most one daemon may run per runtime dir. Ownership is decided solely
//! by an exclusive create of the lock file; a PID liveness probe is used
//! only to break stale locks left by crashed daemons, never to grant
//! ownership directly. Release removes the marker only if it still names
//! our PID, so a delayed cleanup can never remove a successor's lock.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Record written to the lock file asserting "a daemon is running here".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub acquired_at: u64,
}

impl LockRecord {
    fn for_current_process() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    /// Transient filesystem trouble; assume another instance may exist.
    #[error("lock unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of a lock acquisition attempt.
pub enum LockState {
    /// We own the lock; dropping the guard releases it.
    AcquiredAsOwner(LockGuard),
    /// A live daemon already holds the lock.
    LiveElsewhere { pid: u32 },
}

/// Held lock; removes the marker on drop iff it still names our PID.
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn release(&self) {
        match read_record(&self.path) {
            Some(record) if record.pid == self.pid => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove lock marker");
                } else {
                    debug!(path = %self.path.display(), "Released singleton lock");
                }
            }
            Some(record) => {
                // Never remove a marker we do not own
                debug!(
                    holder_pid = record.pid,
                    "Lock marker belongs to another process, leaving it"
                );
            }
            None => {}
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Attempt to become the singleton owner, or report the live holder.
///
/// The exclusive create is the sole arbiter: if it fails and the recorded
/// holder is dead, the stale marker is removed and the create retried once.
/// Losing that retry means another process won the same race, which is fine.
pub fn acquire_or_detect_live(path: &Path) -> Result<LockState, LockError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| LockError::Unavailable(format!("create {}: {}", parent.display(), e)))?;
    }

    for attempt in 0..2 {
        match try_exclusive_create(path) {
            Ok(guard) => {
                info!(path = %path.display(), pid = guard.pid, "Acquired singleton lock");
                return Ok(LockState::AcquiredAsOwner(guard));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = read_record(path);
                match holder {
                    Some(record) if pid_alive(record.pid) => {
                        debug!(pid = record.pid, "Singleton lock held by live process");
                        return Ok(LockState::LiveElsewhere { pid: record.pid });
                    }
                    other => {
                        if attempt > 0 {
                            // Second failed create after removing a stale
                            // marker: someone else won the race.
                            let pid = other.map(|r| r.pid).unwrap_or(0);
                            return Ok(LockState::LiveElsewhere { pid });
                        }
                        let stale_pid = other.as_ref().map(|r| r.pid);
                        info!(pid = ?stale_pid, "Removing stale lock marker");
                        if let Err(e) = std::fs::remove_file(path)
                            && e.kind() != std::io::ErrorKind::NotFound
                        {
                            return Err(LockError::Unavailable(format!(
                                "remove stale marker: {}",
                                e
                            )));
                        }
                    }
                }
            }
            // Fail safe: do not risk starting a second daemon
            Err(e) => return Err(LockError::Unavailable(e.to_string())),
        }
    }

    unreachable!("second attempt always returns")
}

fn try_exclusive_create(path: &Path) -> std::io::Result<LockGuard> {
    let record = LockRecord::for_current_process();
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let body = serde_json::to_string_pretty(&record)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    file.write_all(body.as_bytes())?;
    file.flush()?;
    Ok(LockGuard {
        path: path.to_path_buf(),
        pid: record.pid,
    })
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Signal-probe liveness check; EPERM means the process exists.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("inference.lock")
    }

    #[test]
    fn test_acquire_on_cold_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        match acquire_or_detect_live(&path).unwrap() {
            LockState::AcquiredAsOwner(guard) => {
                assert!(path.exists());
                let record = read_record(&path).unwrap();
                assert_eq!(record.pid, std::process::id());
                drop(guard);
                assert!(!path.exists(), "release should remove the marker");
            }
            LockState::LiveElsewhere { .. } => panic!("expected ownership"),
        }
    }

    #[test]
    fn test_live_holder_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        let _guard = match acquire_or_detect_live(&path).unwrap() {
            LockState::AcquiredAsOwner(g) => g,
            _ => panic!("expected ownership"),
        };

        // Our own PID is alive, so a second attempt must defer
        match acquire_or_detect_live(&path).unwrap() {
            LockState::LiveElsewhere { pid } => assert_eq!(pid, std::process::id()),
            LockState::AcquiredAsOwner(_) => panic!("two owners"),
        }
    }

    #[test]
    fn test_stale_lock_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        // A process that has already exited
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let record = LockRecord {
            pid: dead_pid,
            acquired_at: 0,
        };
        std::fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();

        match acquire_or_detect_live(&path).unwrap() {
            LockState::AcquiredAsOwner(_) => {}
            LockState::LiveElsewhere { .. } => panic!("stale lock should be broken"),
        }
    }

    #[test]
    fn test_garbage_marker_treated_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            acquire_or_detect_live(&path).unwrap(),
            LockState::AcquiredAsOwner(_)
        ));
    }

    #[test]
    fn test_release_skips_marker_owned_by_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(&dir);

        let guard = match acquire_or_detect_live(&path).unwrap() {
            LockState::AcquiredAsOwner(g) => g,
            _ => panic!("expected ownership"),
        };

        // Simulate a successor taking over the marker
        let other = LockRecord {
            pid: 1,
            acquired_at: 0,
        };
        std::fs::write(&path, serde_json::to_string(&other).unwrap()).unwrap();

        drop(guard);
        assert!(path.exists(), "must not remove a marker we do not own");
    }

    #[test]
    fn test_pid_alive_self_and_invalid() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
    }
}
