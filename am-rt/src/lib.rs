mod ao;
mod fault;
mod pal;
mod pubsub;
mod timer;

pub use crate::{
    ao::{ActiveObject, AoDyn, AoRegistry, Cooperative, Preemptive, Priority, post_to},
    fault::{ao_fault, log_event_queues, log_last_events},
    pal::{Pal, StdPal, TaskId},
    pubsub::{SubscribeTable, publish_exclude_x},
    timer::{TimerId, TimerWheel},
};
