#![allow(unsafe_code)]

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

use tracing::warn;

use crate::types::{RegionError, Result};

/// Exclusive claim on a region's backing file, held by the initializing node.
///
/// Uses `flock`, so the claim conflicts with every other open file
/// description, including a second open from the same process. Joiners never
/// take it.
#[derive(Debug)]
pub struct InitLock {
    file: File,
    path: PathBuf,
}

impl InitLock {
    /// Attempts to claim `file` without blocking.
    ///
    /// Returns [`RegionError::Locked`] when another initializer already holds
    /// the region.
    pub fn try_acquire(file: &File, path: &Path) -> Result<Self> {
        let file = file.try_clone().map_err(RegionError::from)?;
        match flock_exclusive(&file) {
            Ok(true) => Ok(Self {
                file,
                path: path.to_path_buf(),
            }),
            Ok(false) => Err(RegionError::Locked(path.to_path_buf())),
            Err(err) => Err(RegionError::from(err)),
        }
    }

    /// Path of the claimed file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InitLock {
    fn drop(&mut self) {
        if let Err(err) = funlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "concurrency.init_lock.release_failed");
        }
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    loop {
        let res = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if res == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EWOULDBLOCK) => return Ok(false),
            _ => return Err(err),
        }
    }
}

#[cfg(unix)]
fn funlock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if res == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "file locking unsupported on this platform",
    ))
}

#[cfg(not(unix))]
fn funlock(_file: &File) -> io::Result<()> {
    Ok(())
}

const SPINS_BEFORE_YIELD: u32 = 128;

/// Test-and-set lock over a word that may live in shared memory.
///
/// The word is plain memory inside the region, so the lock works between
/// processes as long as they map the same bytes.
pub struct SpinLock<'a> {
    word: &'a AtomicU32,
}

/// Releases the [`SpinLock`] on drop.
pub struct SpinGuard<'a> {
    word: &'a AtomicU32,
}

impl<'a> SpinLock<'a> {
    /// Wraps a lock word. Zero means unlocked.
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    /// Spins until the lock is acquired.
    pub fn lock(&self) -> SpinGuard<'a> {
        let mut spins = 0u32;
        loop {
            if self
                .word
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinGuard { word: self.word };
            }
            while self.word.load(Ordering::Relaxed) != 0 {
                spins = spins.wrapping_add(1);
                if spins % SPINS_BEFORE_YIELD == 0 {
                    thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<SpinGuard<'a>> {
        self.word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinGuard { word: self.word })
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

/// Pins the calling thread to a single CPU.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> io::Result<()> {
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "cpu index exceeds CPU_SETSIZE",
        ));
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let res = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

/// Pins the calling thread to a single CPU.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "thread affinity unsupported on this platform",
    ))
}
