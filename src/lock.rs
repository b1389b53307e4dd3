//! Process-local shared-exclusive lock coordinating concurrent access to
//! the index and data file.
//!
//! `std::sync::RwLock` does not document a fairness policy on any
//! platform, and in practice can starve writers under sustained read
//! load — unacceptable given the writer-fairness invariant this store
//! requires. This is a small ticket-based lock built directly on
//! `Mutex` + `Condvar`, generic over the protected value the same way
//! `std::sync::RwLock<T>` is: once a writer is waiting, readers that
//! arrive afterward queue behind it instead of continuing to cut in
//! line.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

struct Queue {
    readers_active: u32,
    writer_active: bool,
    writers_waiting: u32,
}

/// A writer-fair shared-exclusive lock guarding a value of type `T`.
pub struct SharedExclusiveLock<T> {
    queue: Mutex<Queue>,
    condvar: Condvar,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is only ever granted through `SharedGuard`
// (shared `&T`, any number concurrently) or `ExclusiveGuard` (`&mut T`,
// alone), both gated by `queue`/`condvar` exactly as `std::sync::RwLock`
// gates its own interior cell.
unsafe impl<T: Send> Send for SharedExclusiveLock<T> {}
unsafe impl<T: Send> Sync for SharedExclusiveLock<T> {}

impl<T> SharedExclusiveLock<T> {
    pub fn new(data: T) -> Self {
        SharedExclusiveLock {
            queue: Mutex::new(Queue {
                readers_active: 0,
                writer_active: false,
                writers_waiting: 0,
            }),
            condvar: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Blocks until a shared (read) hold is granted.
    ///
    /// Fairness: if any writer is currently waiting, this call blocks
    /// behind it even though no writer currently holds the lock.
    pub fn read(&self) -> SharedGuard<'_, T> {
        let mut guard = self.queue.lock().unwrap();
        while guard.writer_active || guard.writers_waiting > 0 {
            guard = self.condvar.wait(guard).unwrap();
        }
        guard.readers_active += 1;
        drop(guard);
        SharedGuard { lock: self }
    }

    /// Blocks until an exclusive (write) hold is granted. Registers a
    /// waiting-writer ticket immediately so readers that arrive after
    /// this call queue behind it.
    pub fn write(&self) -> ExclusiveGuard<'_, T> {
        let mut guard = self.queue.lock().unwrap();
        guard.writers_waiting += 1;
        while guard.writer_active || guard.readers_active > 0 {
            guard = self.condvar.wait(guard).unwrap();
        }
        guard.writers_waiting -= 1;
        guard.writer_active = true;
        drop(guard);
        ExclusiveGuard { lock: self }
    }

    fn release_shared(&self) {
        let mut guard = self.queue.lock().unwrap();
        debug_assert!(guard.readers_active > 0);
        guard.readers_active -= 1;
        if guard.readers_active == 0 {
            self.condvar.notify_all();
        }
    }

    fn release_exclusive(&self) {
        let mut guard = self.queue.lock().unwrap();
        debug_assert!(guard.writer_active);
        guard.writer_active = false;
        self.condvar.notify_all();
    }
}

/// RAII read guard; derefs to `&T`.
pub struct SharedGuard<'a, T> {
    lock: &'a SharedExclusiveLock<T>,
}

impl<T> Deref for SharedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for SharedGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

/// RAII write guard; derefs to `&T`/`&mut T`.
pub struct ExclusiveGuard<'a, T> {
    lock: &'a SharedExclusiveLock<T>,
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn multiple_readers_run_concurrently() {
        let lock = Arc::new(SharedExclusiveLock::new(0u32));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let concurrent = Arc::clone(&concurrent);
            let max_seen = Arc::clone(&max_seen);
            handles.push(thread::spawn(move || {
                let _g = lock.read();
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn exclusive_excludes_everyone() {
        let lock = Arc::new(SharedExclusiveLock::new(0u32));
        let inside = Arc::new(AtomicBool::new(false));
        let violated = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let violated = Arc::clone(&violated);
            handles.push(thread::spawn(move || {
                let mut g = lock.write();
                *g += 1;
                if inside.swap(true, Ordering::SeqCst) {
                    violated.store(true, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(5));
                inside.store(false, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(!violated.load(Ordering::SeqCst));
        assert_eq!(*lock.read(), 6);
    }

    /// P6: writer non-starvation under sustained read load.
    #[test]
    fn writer_is_not_starved_by_continuous_readers() {
        let lock = Arc::new(SharedExclusiveLock::new(0u32));
        let stop = Arc::new(AtomicBool::new(false));

        let mut reader_handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let stop = Arc::clone(&stop);
            reader_handles.push(thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let _g = lock.read();
                    thread::sleep(Duration::from_millis(1));
                }
            }));
        }

        // Let the reader storm ramp up before the writer joins.
        thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        {
            let mut g = lock.write();
            *g += 1;
        }
        let elapsed = start.elapsed();

        stop.store(true, Ordering::SeqCst);
        for h in reader_handles {
            h.join().unwrap();
        }

        assert!(
            elapsed < Duration::from_millis(500),
            "writer waited {:?}",
            elapsed
        );
    }
}
