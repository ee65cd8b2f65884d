//! Shared fault handling for contract violations: one log line naming the
//! assertion and its call site, then a panic. Every fatal path in this
//! crate calls through here instead of a bare `assert!`/`panic!`, so an
//! operator reading the log always sees the same shape of diagnostic
//! regardless of which invariant actually tripped.
//!
//! Call sites that also have a pool registry at hand use [`fault`], which
//! adds a free/in-use dump for every pool before panicking; the HSM
//! dispatcher has no pool of its own to report, so it uses [`fault_bare`].
//! `am_rt`'s own fault path (`am_rt::fault::ao_fault`) wraps [`fault`] again
//! with an event-queue dump, since only the runtime knows about AOs.

use crate::event::EventPools;

/// Logs `msg`, dumps every registered pool's free/in-use block counts, then
/// panics. Never returns.
pub fn fault(msg: &str, pools: &EventPools) -> ! {
    log::error!("{msg}");
    log_pool_usage(pools);
    panic!("{msg}");
}

/// As [`fault`], for call sites with no pool registry reachable.
pub fn fault_bare(msg: &str) -> ! {
    log::error!("{msg}");
    panic!("{msg}");
}

pub fn log_pool_usage(pools: &EventPools) {
    for i in 0..pools.npools() {
        log::error!("pool {i}: {}/{} free (min seen {})", pools.nfree(i), pools.nblocks(i), pools.nfree_min(i));
    }
}
