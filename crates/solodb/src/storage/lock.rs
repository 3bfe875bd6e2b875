//! Reader/writer locking: single writer, many readers.
//!
//! Two layers guard the data file. In-process, a mutex + condvar pair
//! implements a shared/exclusive lock with a reader capacity and a
//! wall-clock timeout; a writer claims the lock first and then drains the
//! running readers, so new readers cannot starve it. Across processes, a
//! small slot file next to the database is polled every 250ms: each waiting
//! process claims a byte-sized slot, readers run together, and a writer
//! runs only once every other slot has drained.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use solodb_common::{Result, SoloError};

/// Maximum concurrent readers inside one process.
pub const MAX_SHARED: u32 = 100;

/// Number of byte slots in the cross-process lock file.
pub const LOCK_SLOTS: usize = 100;

/// Cross-process polling interval.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default lock acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    writer: bool,
    /// Cross-process slot held while any reader runs.
    shared_slot: Option<usize>,
    /// Cross-process slot held by the running writer.
    writer_slot: Option<usize>,
}

/// Shared/exclusive lock over one database.
pub struct LockService {
    state: Mutex<LockState>,
    cond: Condvar,
    timeout: Duration,
    cross: Option<CrossProcessLock>,
}

impl LockService {
    pub fn new(timeout: Duration, cross: Option<CrossProcessLock>) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
            timeout,
            cross,
        }
    }

    /// Acquire the lock in shared (reader) mode.
    pub fn enter_shared(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();

        while state.writer || state.readers >= MAX_SHARED {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return Err(SoloError::LockTimeout(self.timeout));
            }
        }

        state.readers += 1;

        if state.readers == 1 {
            if let Some(cross) = &self.cross {
                match cross.acquire_shared(deadline) {
                    Ok(slot) => state.shared_slot = Some(slot),
                    Err(e) => {
                        state.readers -= 1;
                        self.cond.notify_all();
                        return Err(self.stamp_timeout(e));
                    }
                }
            }
        }

        Ok(())
    }

    /// Release a shared hold.
    pub fn exit_shared(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);

        if state.readers == 0 {
            if let (Some(cross), Some(slot)) = (&self.cross, state.shared_slot.take()) {
                cross.release(slot);
            }
        }
        self.cond.notify_all();
    }

    /// Acquire the lock in exclusive (writer) mode. Claims the writer flag
    /// first, then drains running readers.
    pub fn enter_exclusive(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();

        while state.writer {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return Err(SoloError::LockTimeout(self.timeout));
            }
        }
        state.writer = true;

        while state.readers > 0 {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                state.writer = false;
                self.cond.notify_all();
                return Err(SoloError::LockTimeout(self.timeout));
            }
        }

        if let Some(cross) = &self.cross {
            match cross.acquire_exclusive(deadline) {
                Ok(slot) => state.writer_slot = Some(slot),
                Err(e) => {
                    state.writer = false;
                    self.cond.notify_all();
                    return Err(self.stamp_timeout(e));
                }
            }
        }

        Ok(())
    }

    /// Cross-process timeouts carry no duration of their own; report the
    /// service-wide timeout instead.
    fn stamp_timeout(&self, err: SoloError) -> SoloError {
        match err {
            SoloError::LockTimeout(_) => SoloError::LockTimeout(self.timeout),
            other => other,
        }
    }

    /// Release the exclusive hold.
    pub fn exit_exclusive(&self) {
        let mut state = self.state.lock();
        if let (Some(cross), Some(slot)) = (&self.cross, state.writer_slot.take()) {
            cross.release(slot);
        }
        state.writer = false;
        self.cond.notify_all();
    }
}

// Cross-process slot file

const SLOT_FREE: u8 = 0;
const SLOT_READER: u8 = 1;
const SLOT_WRITER_WAIT: u8 = 2;
const SLOT_WRITER_RUN: u8 = 3;

/// Slot-file lock shared between processes opening the same database.
///
/// Advisory: claims are plain byte writes with no atomicity guarantee, so
/// each process starts probing at a pid-derived slot to keep claims apart.
/// The in-process [`LockService`] remains authoritative within a process.
pub struct CrossProcessLock {
    file: Mutex<File>,
}

impl CrossProcessLock {
    /// Open (or create) the lock file next to the database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < LOCK_SLOTS as u64 {
            file.set_len(LOCK_SLOTS as u64)?;
        }
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn read_slots(&self) -> Result<[u8; LOCK_SLOTS]> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut slots = [0u8; LOCK_SLOTS];
        file.read_exact(&mut slots)?;
        Ok(slots)
    }

    fn write_slot(&self, index: usize, value: u8) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(index as u64))?;
        file.write_all(&[value])?;
        file.flush()?;
        Ok(())
    }

    /// Claim the first free slot, probing from a pid-derived start.
    fn claim(&self, value: u8) -> Result<usize> {
        let slots = self.read_slots()?;
        let start = std::process::id() as usize % LOCK_SLOTS;

        for i in 0..LOCK_SLOTS {
            let index = (start + i) % LOCK_SLOTS;
            if slots[index] == SLOT_FREE {
                self.write_slot(index, value)?;
                return Ok(index);
            }
        }
        Err(SoloError::Storage("no free lock slots".into()))
    }

    /// Claim a reader slot and wait until no writer is waiting or running.
    fn acquire_shared(&self, deadline: Instant) -> Result<usize> {
        let slot = self.claim(SLOT_READER)?;

        loop {
            let slots = self.read_slots()?;
            let writer_active = slots
                .iter()
                .enumerate()
                .any(|(i, &s)| i != slot && (s == SLOT_WRITER_WAIT || s == SLOT_WRITER_RUN));

            if !writer_active {
                return Ok(slot);
            }
            if Instant::now() >= deadline {
                let _ = self.write_slot(slot, SLOT_FREE);
                return Err(SoloError::LockTimeout(Duration::ZERO));
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    /// Claim a writer slot and wait until every other slot has drained.
    /// Two waiting writers tie-break by slot index: the lower index wins.
    fn acquire_exclusive(&self, deadline: Instant) -> Result<usize> {
        let slot = self.claim(SLOT_WRITER_WAIT)?;

        loop {
            let slots = self.read_slots()?;
            let safe = slots.iter().enumerate().all(|(i, &s)| {
                i == slot || s == SLOT_FREE || (s == SLOT_WRITER_WAIT && i > slot)
            });

            if safe {
                self.write_slot(slot, SLOT_WRITER_RUN)?;
                return Ok(slot);
            }
            if Instant::now() >= deadline {
                let _ = self.write_slot(slot, SLOT_FREE);
                return Err(SoloError::LockTimeout(Duration::ZERO));
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    fn release(&self, slot: usize) {
        let _ = self.write_slot(slot, SLOT_FREE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_readers_run_concurrently() {
        let lock = LockService::new(Duration::from_secs(5), None);
        lock.enter_shared().unwrap();
        lock.enter_shared().unwrap();
        lock.exit_shared();
        lock.exit_shared();
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = Arc::new(LockService::new(Duration::from_secs(5), None));
        let peak = Arc::new(AtomicU32::new(0));
        let inside = Arc::new(AtomicU32::new(0));

        lock.enter_exclusive().unwrap();

        let reader = {
            let (lock, peak, inside) = (lock.clone(), peak.clone(), inside.clone());
            std::thread::spawn(move || {
                lock.enter_shared().unwrap();
                let n = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(n, Ordering::SeqCst);
                inside.fetch_sub(1, Ordering::SeqCst);
                lock.exit_shared();
            })
        };

        // Reader must not enter while the writer holds the lock
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(inside.load(Ordering::SeqCst), 0);

        lock.exit_exclusive();
        reader.join().unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_writer_waits_for_readers_to_drain() {
        let lock = Arc::new(LockService::new(Duration::from_secs(5), None));
        lock.enter_shared().unwrap();

        let writer = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                lock.enter_exclusive().unwrap();
                lock.exit_exclusive();
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());

        lock.exit_shared();
        writer.join().unwrap();
    }

    #[test]
    fn test_timeout_error() {
        let lock = Arc::new(LockService::new(Duration::from_millis(100), None));
        lock.enter_exclusive().unwrap();

        let err = lock.enter_shared().unwrap_err();
        assert!(matches!(err, SoloError::LockTimeout(_)));

        lock.exit_exclusive();
        lock.enter_shared().unwrap();
        lock.exit_shared();
    }

    #[test]
    fn test_cross_process_slots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let lock = CrossProcessLock::open(&path).unwrap();

        let deadline = Instant::now() + Duration::from_millis(100);
        let r1 = lock.acquire_shared(deadline).unwrap();
        let r2 = lock.acquire_shared(deadline).unwrap();
        assert_ne!(r1, r2);

        // A writer cannot run while readers hold slots
        let deadline = Instant::now() + Duration::from_millis(300);
        assert!(lock.acquire_exclusive(deadline).is_err());

        lock.release(r1);
        lock.release(r2);

        let deadline = Instant::now() + Duration::from_millis(300);
        let w = lock.acquire_exclusive(deadline).unwrap();

        // And readers defer to a running writer
        let deadline = Instant::now() + Duration::from_millis(300);
        assert!(lock.acquire_shared(deadline).is_err());

        lock.release(w);
    }
}
