//! Runtime-level fault handling: wraps `am_core::fault::fault` with the
//! dumps only this crate can produce, since only it knows about AOs and
//! their queues. Used by every fatal contract violation in the scheduler
//! back-ends (a foreign-task `stop`, a slot invariant break).

use am_core::event::EventPools;

use crate::ao::AoRegistry;

/// Logs `msg`, dumps every AO's queue occupancy and last dispatched event,
/// dumps every pool's free/in-use counts, then panics.
pub fn ao_fault(msg: &str, registry: &AoRegistry, pools: &EventPools) -> ! {
    log::error!("{msg}");
    log_event_queues(registry);
    log_last_events(registry);
    am_core::fault::log_pool_usage(pools);
    panic!("{msg}");
}

/// Logs every occupied slot's priority, name, and queue length.
pub fn log_event_queues(registry: &AoRegistry) {
    for (prio, ao) in registry.iter() {
        log::error!("ao prio={prio} name={} queue_len={}", ao.name(), ao.len());
    }
}

/// Logs every occupied slot's most recently dispatched event id.
pub fn log_last_events(registry: &AoRegistry) {
    for (prio, ao) in registry.iter() {
        match ao.last_event() {
            Some(id) => log::error!("ao prio={prio} name={} last_event={id}", ao.name()),
            None => log::error!("ao prio={prio} name={} last_event=none", ao.name()),
        }
    }
}
