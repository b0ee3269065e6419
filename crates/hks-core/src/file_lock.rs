//! Per-path reader/writer locks. Readers of one path share, a writer excludes everyone.
//! Built without the `thread` feature the registry hands out empty guards.

use std::path::Path;

#[cfg(feature = "thread")]
use std::{collections::HashMap, path::PathBuf, sync::Arc};

#[cfg(feature = "thread")]
use parking_lot::{
    Mutex, RawRwLock, RwLock,
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
};

#[cfg(feature = "thread")]
#[derive(Default)]
pub struct FileLockRegistry {
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

#[cfg(feature = "thread")]
#[must_use = "the lock is released when the guard is dropped"]
pub struct FileReadGuard {
    _guard: ArcRwLockReadGuard<RawRwLock, ()>,
}

#[cfg(feature = "thread")]
#[must_use = "the lock is released when the guard is dropped"]
pub struct FileWriteGuard {
    _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
}

#[cfg(feature = "thread")]
impl FileLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_read(&self, path: &Path) -> FileReadGuard {
        let lock = self.lock_for(path);
        FileReadGuard {
            _guard: lock.read_arc(),
        }
    }

    pub fn acquire_write(&self, path: &Path) -> FileWriteGuard {
        let lock = self.lock_for(path);
        FileWriteGuard {
            _guard: lock.write_arc(),
        }
    }

    /// Paths with a live lock entry.
    pub fn tracked(&self) -> usize {
        let mut locks = self.locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.len()
    }

    fn lock_for(&self, path: &Path) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        // entries only the map still references belong to nobody
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(path.to_path_buf()).or_default().clone()
    }
}

#[cfg(not(feature = "thread"))]
#[derive(Default)]
pub struct FileLockRegistry;

#[cfg(not(feature = "thread"))]
#[must_use = "the lock is released when the guard is dropped"]
pub struct FileReadGuard;

#[cfg(not(feature = "thread"))]
#[must_use = "the lock is released when the guard is dropped"]
pub struct FileWriteGuard;

#[cfg(not(feature = "thread"))]
impl FileLockRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn acquire_read(&self, _path: &Path) -> FileReadGuard {
        FileReadGuard
    }

    pub fn acquire_write(&self, _path: &Path) -> FileWriteGuard {
        FileWriteGuard
    }

    pub fn tracked(&self) -> usize {
        0
    }
}

#[cfg(all(test, feature = "thread"))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share_a_path() {
        let registry = FileLockRegistry::new();
        let path = Path::new("/data/key/a");
        let first = registry.acquire_read(path);
        let second = registry.acquire_read(path);
        assert_eq!(registry.tracked(), 1);
        drop(first);
        drop(second);
        assert_eq!(registry.tracked(), 0);
    }

    #[test]
    fn writer_excludes_readers() {
        let registry = Arc::new(FileLockRegistry::new());
        let path = PathBuf::from("/data/key/a");
        let released = Arc::new(AtomicBool::new(false));

        let writer = registry.acquire_write(&path);
        let handle = {
            let registry = Arc::clone(&registry);
            let released = Arc::clone(&released);
            let path = path.clone();
            thread::spawn(move || {
                let _reader = registry.acquire_read(&path);
                released.load(Ordering::SeqCst)
            })
        };
        thread::sleep(Duration::from_millis(50));
        released.store(true, Ordering::SeqCst);
        drop(writer);
        assert!(handle.join().expect("reader thread"));
    }

    #[test]
    fn distinct_paths_do_not_contend() {
        let registry = FileLockRegistry::new();
        let _main = registry.acquire_write(Path::new("/main/key/a"));
        let _backup = registry.acquire_write(Path::new("/bak/key.bak/a.bak"));
        assert_eq!(registry.tracked(), 2);
    }
}
