mod config;
mod connection;
mod driver;
mod errors;
mod reaper;
pub mod registry;
pub mod signal;
#[cfg(test)]
mod test;
mod timer_list;

pub use config::ReaperConfig;
pub use connection::{ClientData, ReapReason, Reaped, ServerContext, on_expire};
pub use driver::{Alarm, Clock, ManualClock, MonotonicClock, SigAlarm, TickDriver, WallClock};
pub use errors::IdleClockError;
pub use reaper::IdleReaper;
pub use timer_list::{ExpireFn, Iter, Timer, TimerHandle, TimerList, Timestamp};

pub mod prelude {
    pub use super::{
        IdleClockError, IdleReaper, ReaperConfig, Reaped, Timer, TimerHandle, TimerList, Timestamp,
        registry::{Epoll, deregister, make_non_blocking, register_for_readiness},
        signal::{LoopSignals, Notification, NotifyPipe, on_signal, register_signal},
    };
}
