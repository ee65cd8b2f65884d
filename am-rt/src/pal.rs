//! Platform abstraction layer: the runtime's only window onto tasks,
//! mutexes, critical sections, and clocks. A concrete [`Pal`] is supplied
//! by the embedder; [`StdPal`] is the hosted-POSIX reference used by this
//! crate's own tests and by `cfg(test)` callers that just need something
//! that works.
//!
//! The contract is specified abstractly and deliberately thin: tasks,
//! mutexes, a non-reentrant critical section, and tick/wall clocks. Stack
//! sizing and task priority are accepted but are advisory on a host OS —
//! an embedded `Pal` backed by an RTOS would honor them for real.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Opaque task handle. `Pal` implementors may widen this with more fields
/// as long as it stays `Copy`.
pub trait TaskId: Copy + Eq + std::fmt::Debug + Send + 'static {}
impl<T: Copy + Eq + std::fmt::Debug + Send + 'static> TaskId for T {}

pub trait Pal: Send + Sync {
    /// Spawns a host task running `entry`. `prio` and `stack_size` are
    /// advisory.
    fn task_create(&self, name: &'static str, prio: u8, stack_size: usize, entry: Box<dyn FnOnce() + Send>) -> usize;
    fn task_notify(&self, id: usize);
    /// Blocks the calling task until it is notified.
    fn task_wait(&self);
    fn task_get_own_id(&self) -> usize;
    /// Blocks until [`Self::unlock_start_barrier`] has been called once.
    /// The one-shot startup barrier: embedder tasks created before the
    /// scheduler starts must not touch AOs until this returns.
    fn task_wait_all(&self);
    fn unlock_start_barrier(&self);

    /// Non-reentrant critical section. Must be short: no user handlers run
    /// while held. `crit_enter`/`crit_exit` are paired calls rather than an
    /// RAII scope because callers (the AO scheduler, the timer tick) exit
    /// and re-enter mid-algorithm rather than holding one nested scope.
    fn crit_enter(&self);
    fn crit_exit(&self);

    fn time_get_ms(&self) -> u64;
    fn time_get_tick(&self, domain: u8) -> u64;
    fn time_get_tick_from_ms(&self, domain: u8, ms: u64) -> u64;
    fn sleep_ms(&self, ms: u64);
    fn sleep_till_ticks(&self, domain: u8, ticks: u64);

    /// Called from inside the cooperative scheduler's critical section
    /// when no AO is ready. May transition the CPU to a low-power state;
    /// must not post or publish.
    fn on_idle(&self);
}

struct StartBarrier {
    mutex: Mutex<bool>,
    condvar: Condvar,
}

/// Hosted-POSIX `Pal`: `std::thread` tasks, a spinlock as the critical
/// section (a real `Mutex` has no safe way to hand an unlock token back
/// across two separate trait calls; critical sections here are always
/// short, so busy-waiting is cheap), and `Instant` as the clock.
pub struct StdPal {
    crit: AtomicBool,
    start_barrier: StartBarrier,
    epoch: Instant,
    tick_ms: [u64; am_sys::TICK_DOMAINS_MAX_DEFAULT as usize],
    next_task_id: std::sync::atomic::AtomicUsize,
    notifications: Mutex<std::collections::HashMap<usize, std::sync::Arc<(Mutex<bool>, Condvar)>>>,
}

impl StdPal {
    pub fn new(tick_ms: [u64; am_sys::TICK_DOMAINS_MAX_DEFAULT as usize]) -> Self {
        StdPal {
            crit: AtomicBool::new(false),
            start_barrier: StartBarrier { mutex: Mutex::new(false), condvar: Condvar::new() },
            epoch: Instant::now(),
            tick_ms,
            next_task_id: std::sync::atomic::AtomicUsize::new(1),
            notifications: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn notify_cell(&self, id: usize) -> std::sync::Arc<(Mutex<bool>, Condvar)> {
        self.notifications
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| std::sync::Arc::new((Mutex::new(false), Condvar::new())))
            .clone()
    }
}

thread_local! {
    static OWN_TASK_ID: std::cell::Cell<usize> = std::cell::Cell::new(0);
}

impl Pal for StdPal {
    fn task_create(&self, name: &'static str, _prio: u8, _stack_size: usize, entry: Box<dyn FnOnce() + Send>) -> usize {
        let id = self.next_task_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                OWN_TASK_ID.with(|c| c.set(id));
                entry();
            })
            .expect("failed to spawn AO task");
        id
    }

    fn task_notify(&self, id: usize) {
        let cell = self.notify_cell(id);
        let (lock, cv) = &*cell;
        *lock.lock().unwrap() = true;
        cv.notify_one();
    }

    fn task_wait(&self) {
        let id = self.task_get_own_id();
        let cell = self.notify_cell(id);
        let (lock, cv) = &*cell;
        let mut pending = lock.lock().unwrap();
        while !*pending {
            pending = cv.wait(pending).unwrap();
        }
        *pending = false;
    }

    fn task_get_own_id(&self) -> usize {
        OWN_TASK_ID.with(|c| c.get())
    }

    fn task_wait_all(&self) {
        let mut started = self.start_barrier.mutex.lock().unwrap();
        while !*started {
            started = self.start_barrier.condvar.wait(started).unwrap();
        }
    }

    fn unlock_start_barrier(&self) {
        let mut started = self.start_barrier.mutex.lock().unwrap();
        *started = true;
        self.start_barrier.condvar.notify_all();
    }

    fn crit_enter(&self) {
        while self.crit.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed).is_err() {
            std::hint::spin_loop();
        }
    }

    fn crit_exit(&self) {
        self.crit.store(false, Ordering::Release);
    }

    fn time_get_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn time_get_tick(&self, domain: u8) -> u64 {
        self.time_get_ms() / self.tick_ms[domain as usize].max(1)
    }

    fn time_get_tick_from_ms(&self, domain: u8, ms: u64) -> u64 {
        ms / self.tick_ms[domain as usize].max(1)
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn sleep_till_ticks(&self, domain: u8, ticks: u64) {
        let target_ms = ticks * self.tick_ms[domain as usize].max(1);
        let now_ms = self.time_get_ms();
        if target_ms > now_ms {
            self.sleep_ms(target_ms - now_ms);
        }
    }

    fn on_idle(&self) {
        std::thread::yield_now();
    }
}
