//! Tick lock: one scheduler tick at a time per data directory

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Exclusive lock held for the duration of one scheduler tick
pub struct TickLock {
    path: PathBuf,
    file: File,
    lease_until: Instant,
}

/// Lock file content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at_ms: u64,
    pub lease_ms: u64,
}

impl LockHolder {
    /// Whether the holder's lease has run out
    pub fn lease_expired(&self, now_ms: u64) -> bool {
        now_ms > self.acquired_at_ms.saturating_add(self.lease_ms)
    }
}

impl TickLock {
    /// Take the tick lock in `dir`, trying `retries` more times `wait` apart.
    ///
    /// Returns `None` if another holder kept the lock throughout.
    pub fn acquire(
        dir: &Path,
        lease: Duration,
        retries: u32,
        wait: Duration,
    ) -> Result<Option<Self>> {
        let path = lock_path(dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create locks directory")?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .context("Failed to open tick lock file")?;

        for attempt in 0..=retries {
            if try_flock_exclusive(&file)? {
                write_holder(&mut file, lease)?;
                debug!(path = %path.display(), ?lease, "tick lock acquired");
                return Ok(Some(Self {
                    path,
                    file,
                    lease_until: Instant::now() + lease,
                }));
            }

            if attempt < retries {
                std::thread::sleep(wait);
            }
        }

        let holder = read_holder(&mut file).ok();
        info!(?holder, "tick lock busy, skipping");
        Ok(None)
    }

    /// Whether the lease still covers more work
    pub fn is_valid(&self) -> bool {
        Instant::now() < self.lease_until
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock now
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for TickLock {
    fn drop(&mut self) {
        // The flock itself goes away with the descriptor
        let _ = self.file.set_len(0);
    }
}

/// Location of the tick lock under a data directory
pub fn lock_path(dir: &Path) -> PathBuf {
    dir.join("locks").join("tick.lock")
}

/// Current holder of the tick lock, if any
pub fn current_holder(dir: &Path) -> Result<Option<LockHolder>> {
    let path = lock_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    let mut file = File::open(&path).context("Failed to open tick lock file")?;
    Ok(read_holder(&mut file).ok())
}

fn write_holder(file: &mut File, lease: Duration) -> Result<()> {
    let holder = LockHolder {
        pid: std::process::id(),
        acquired_at_ms: current_timestamp_ms(),
        lease_ms: lease.as_millis() as u64,
    };
    let serialized = serde_json::to_string(&holder).context("Failed to serialize lock holder")?;

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(serialized.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_holder(file: &mut File) -> Result<LockHolder> {
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).context("Failed to deserialize lock holder")
}

/// Try to acquire exclusive file lock (non-blocking)
#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Check if process is alive
#[cfg(target_os = "macos")]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(target_os = "linux")]
pub fn is_process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
