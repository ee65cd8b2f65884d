//! Facade crate: re-exports the platform layer, the data structures, and
//! the active-object runtime under one name, plus the coroutine macros
//! that only make sense glued to a caller's own HSM state handler.

pub mod coro;

pub use am_core::{
    fault, fault_bare, log_pool_usage, AllocError, BoundedQueue, Event, EventBox, EventPools, Hsm, Outcome, ParentFn,
    Pool, PoolRegistry, PushRc, RingBuf, SList, State, StateFn,
};

pub use am_rt::{ActiveObject, AoDyn, AoRegistry, Cooperative, Pal, Preemptive, Priority, StdPal, SubscribeTable, TimerId, TimerWheel};
pub use am_rt::{ao_fault, log_event_queues, log_last_events, post_to, publish_exclude_x};

pub use am_sys::{
    BitSet64, EVT_ENTRY, EVT_EXIT, EVT_INIT, EVT_INVALID, EVT_RESERVED_SPARE, USER_BASE,
    AO_NUM_MAX_DEFAULT, POOLS_MAX_DEFAULT, TICK_DOMAIN_MAX, TICK_DOMAINS_MAX_DEFAULT,
};

pub use coro::{is_busy, Coro};
