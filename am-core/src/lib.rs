//! Data structures with no knowledge of scheduling or platform: the
//! intrusive list, the bounded queue, the size-class pool, the pooled
//! event subsystem built on top of it, the HSM dispatcher, and the SPSC
//! ring buffer. Everything here is usable from a single-threaded test
//! without `am-rt`'s runtime or a `Pal` implementation at hand.

pub mod event;
pub mod fault;
pub mod hsm;
pub mod list;
pub mod pool;
pub mod queue;
pub mod ringbuf;

pub use event::{AllocError, EventBox, EventPools};
pub use fault::{fault, fault_bare, log_pool_usage};
pub use hsm::{Event, Hsm, Outcome, ParentFn, State, StateFn};
pub use list::SList;
pub use pool::{Pool, PoolRegistry};
pub use queue::{BoundedQueue, PushRc};
pub use ringbuf::RingBuf;
