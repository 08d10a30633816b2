//! Exclusive access to the physical channel.
//!
//! Several processes may share one serial device, so the serial transport
//! guards it with an advisory file lock. An I2C bus shared by several drivers
//! inside one process uses [`SharedLock`]. Where exclusivity is not needed,
//! [`NoLock`] keeps the calling code identical.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use fs2::FileExt;

use crate::timeout::Clock;

pub trait ChannelLock: Send + Sync {
    /// Try once to take the lock. `Ok(false)` means someone else holds it.
    fn try_lock(&self) -> Result<bool, crate::Error>;

    fn unlock(&self) -> Result<(), crate::Error>;
}

/// Take `lock`, trying up to `attempts` times with `delay` between tries.
pub fn acquire(
    lock: &dyn ChannelLock,
    clock: &dyn Clock,
    attempts: u32,
    delay: Duration,
) -> Result<(), crate::Error> {
    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            clock.sleep(delay);
        }
        if lock.try_lock()? {
            return Ok(());
        }
        log::trace!("Channel lock busy (attempt {})", attempt + 1);
    }
    Err(crate::Error::Lock(format!(
        "still held by another user after {} attempts",
        attempts.max(1)
    )))
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoLock;

impl ChannelLock for NoLock {
    fn try_lock(&self) -> Result<bool, crate::Error> {
        Ok(true)
    }

    fn unlock(&self) -> Result<(), crate::Error> {
        Ok(())
    }
}

/// In-process lock; clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct SharedLock {
    held: Arc<AtomicBool>,
}

impl SharedLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl ChannelLock for SharedLock {
    fn try_lock(&self) -> Result<bool, crate::Error> {
        Ok(self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    fn unlock(&self) -> Result<(), crate::Error> {
        self.held.store(false, Ordering::Release);
        Ok(())
    }
}

/// Cross-process advisory lock on a file.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
}

impl FileLock {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, crate::Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                crate::Error::Lock(format!("failed to open {}: {}", path.display(), e))
            })?;
        Ok(Self { path, file })
    }

    /// Lock file for a serial device, placed in the system temp directory.
    pub fn for_port(port: &str) -> Result<Self, crate::Error> {
        let name: String = port
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        Self::new(std::env::temp_dir().join(format!("notecard-{}.lock", name)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChannelLock for FileLock {
    fn try_lock(&self) -> Result<bool, crate::Error> {
        match self.file.try_lock_exclusive() {
            Ok(()) => Ok(true),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
            {
                Ok(false)
            }
            Err(e) => Err(crate::Error::Lock(format!("{}: {}", self.path.display(), e))),
        }
    }

    fn unlock(&self) -> Result<(), crate::Error> {
        FileExt::unlock(&self.file)
            .map_err(|e| crate::Error::Lock(format!("{}: {}", self.path.display(), e)))
    }
}
