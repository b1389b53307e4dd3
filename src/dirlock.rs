// Directory ownership lock for cross-process exclusion.
//
// Grounded on the reference codebase's table-lock module: an advisory OS
// lock (`fs2`) on a sentinel file, held for the lifetime of the owning
// process. Layered on top here is a pidfile convention so a human
// inspecting the data directory (or a liveness probe from another
// process) can see which pid currently owns it without needing to poll
// the OS lock itself.

use crate::error::{io_err, KvError, KvResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// RAII handle on the data directory's `.lock` file. Dropping it releases
/// the OS advisory lock and removes the pidfile.
pub struct DirLock {
    path: PathBuf,
    file: File,
}

/// Acquires ownership of `data_dir` for the current process.
///
/// ## Error Conditions
/// - `DirectoryInUse`: another live process already holds the lock.
///
/// ## Example Usage
/// ```no_run
/// use kv_store::dirlock::acquire;
/// use std::path::Path;
///
/// let _lock = acquire(Path::new("/var/lib/kvstore"))?;
/// // lock released when `_lock` drops
/// # Ok::<(), kv_store::error::KvError>(())
/// ```
pub fn acquire(data_dir: &Path) -> KvResult<DirLock> {
    fs::create_dir_all(data_dir).map_err(|e| io_err("create_data_dir", e))?;
    let lock_path = data_dir.join(".lock");
    let my_pid = std::process::id();

    if let Some(existing_pid) = read_pid(&lock_path)? {
        if existing_pid != my_pid && is_process_alive(existing_pid) {
            return Err(KvError::DirectoryInUse {
                path: data_dir.to_path_buf(),
                pid: existing_pid,
            });
        }
        // Either it's our own pid (sequential open/close within one
        // process) or the previous owner is dead; either way we proceed
        // to take the lock below, which also clears a stale pidfile.
    }

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| io_err("open_lockfile", e))?;

    // The OS advisory lock is the real exclusion mechanism; it covers the
    // case where the pidfile itself was removed or overwritten by
    // something other than this code (e.g. `rm .lock` by an operator
    // while the owner is still alive).
    file.try_lock_exclusive().map_err(|_| {
        // Someone else holds the OS lock even though our pid check above
        // didn't catch it (e.g. pid reuse race); report using whatever
        // pid the file currently names, if any.
        let holder = read_pid(&lock_path).ok().flatten().unwrap_or(0);
        KvError::DirectoryInUse {
            path: data_dir.to_path_buf(),
            pid: holder,
        }
    })?;

    write_pid(&file, my_pid)?;

    Ok(DirLock {
        path: lock_path,
        file,
    })
}

fn read_pid(lock_path: &Path) -> KvResult<Option<u32>> {
    if !lock_path.exists() {
        return Ok(None);
    }
    let mut contents = String::new();
    File::open(lock_path)
        .and_then(|mut f| f.read_to_string(&mut contents))
        .map_err(|e| io_err("read_lockfile", e))?;
    Ok(contents.trim().parse::<u32>().ok())
}

fn write_pid(mut file: &File, pid: u32) -> KvResult<()> {
    use std::io::Seek;
    file.set_len(0).map_err(|e| io_err("truncate_lockfile", e))?;
    file.seek(std::io::SeekFrom::Start(0))
        .map_err(|e| io_err("seek_lockfile", e))?;
    file.write_all(pid.to_string().as_bytes())
        .map_err(|e| io_err("write_lockfile", e))?;
    file.sync_all().map_err(|e| io_err("fsync_lockfile", e))?;
    Ok(())
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    // Signal 0 performs no action but still fails with ESRCH if the
    // process does not exist, and EPERM (which we treat as "alive" —
    // some other user's live process) if it does but we lack
    // permission to signal it.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_alive(pid: u32) -> bool {
    // On Windows, attempting to open a handle to the process is the
    // standard existence probe; any openable process is considered
    // alive, matching the POSIX signal-probe semantics above.
    use std::process::Command;
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid)])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!(
                target: "kv_store::dirlock",
                "failed to remove lockfile {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquires_and_releases() {
        let dir = tempdir().unwrap();
        {
            let _lock = acquire(dir.path()).unwrap();
            assert!(dir.path().join(".lock").exists());
        }
        assert!(!dir.path().join(".lock").exists());
    }

    #[test]
    fn reacquiring_within_same_process_succeeds() {
        let dir = tempdir().unwrap();
        let _lock1 = acquire(dir.path()).unwrap();
        // Same process id "reuses" the lock per the §4.5 contract; our
        // process genuinely still holds the OS lock so re-acquiring
        // inside the same process must not deadlock or error when the
        // held file handle is dropped and reopened.
        drop(_lock1);
        let _lock2 = acquire(dir.path()).unwrap();
    }

    #[test]
    fn stale_pidfile_from_dead_process_is_reclaimed() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join(".lock");
        // A pid essentially guaranteed not to be alive.
        std::fs::write(&lock_path, "999999").unwrap();
        let _lock = acquire(dir.path()).unwrap();
        let pid = read_pid(&lock_path).unwrap().unwrap();
        assert_eq!(pid, std::process::id());
    }
}
