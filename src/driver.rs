pub use alarm::{Alarm, SigAlarm};
pub use clock::{Clock, ManualClock, MonotonicClock, WallClock};
pub use tick::TickDriver;

mod clock {
    use std::{
        cell::Cell,
        time::{Instant, SystemTime, UNIX_EPOCH},
    };

    use crate::timer_list::Timestamp;

    /// Whole-second time source deadlines are computed against.
    pub trait Clock {
        fn now(&self) -> Timestamp;
    }

    /// Seconds since the Unix epoch. Follows system clock adjustments, so a
    /// backward step delays expiry.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct WallClock;

    impl Clock for WallClock {
        fn now(&self) -> Timestamp {
            match SystemTime::now().duration_since(UNIX_EPOCH) {
                Ok(elapsed) => elapsed.as_secs() as Timestamp,
                Err(before_epoch) => -(before_epoch.duration().as_secs() as Timestamp),
            }
        }
    }

    /// Seconds since the clock was created, immune to system clock steps.
    #[derive(Clone, Copy, Debug)]
    pub struct MonotonicClock {
        origin: Instant,
    }

    impl MonotonicClock {
        pub fn new() -> Self {
            Self {
                origin: Instant::now(),
            }
        }
    }

    impl Default for MonotonicClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for MonotonicClock {
        fn now(&self) -> Timestamp {
            self.origin.elapsed().as_secs() as Timestamp
        }
    }

    /// Clock that only moves when told to.
    #[derive(Debug, Default)]
    pub struct ManualClock {
        now: Cell<Timestamp>,
    }

    impl ManualClock {
        pub fn new(start: Timestamp) -> Self {
            Self {
                now: Cell::new(start),
            }
        }
        pub fn set(&self, now: Timestamp) {
            self.now.set(now);
        }
        pub fn advance(&self, secs: Timestamp) {
            self.now.set(self.now.get() + secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Timestamp {
            self.now.get()
        }
    }

    impl<K: Clock + ?Sized> Clock for &K {
        fn now(&self) -> Timestamp {
            (**self).now()
        }
    }
}

mod alarm {
    use std::time::Duration;

    /// Schedules the next `SIGALRM`.
    pub trait Alarm {
        fn arm(&self, after: Duration);
    }

    /// `alarm(2)`. Replaces any pending alarm; sub-second intervals round up
    /// to one second since zero would cancel instead.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SigAlarm;

    impl Alarm for SigAlarm {
        fn arm(&self, after: Duration) {
            let secs = u32::try_from(after.as_secs()).unwrap_or(u32::MAX).max(1);
            unsafe {
                libc::alarm(secs);
            }
        }
    }

    impl<A: Alarm + ?Sized> Alarm for &A {
        fn arm(&self, after: Duration) {
            (**self).arm(after)
        }
    }
}

mod tick {
    use std::time::Duration;

    use crate::timer_list::{TimerList, Timestamp};

    use super::{Alarm, Clock};

    /// Runs the timer list once per alarm and re-arms the alarm.
    pub struct TickDriver<K: Clock, A: Alarm> {
        clock: K,
        alarm: A,
        interval: Duration,
    }

    impl<K: Clock, A: Alarm> TickDriver<K, A> {
        pub fn new(clock: K, alarm: A, interval: Duration) -> Self {
            Self {
                clock,
                alarm,
                interval,
            }
        }

        pub fn now(&self) -> Timestamp {
            self.clock.now()
        }

        pub fn clock(&self) -> &K {
            &self.clock
        }

        /// Arms the first alarm; every later one is armed by [`on_tick`](Self::on_tick).
        pub fn start(&self) {
            self.alarm.arm(self.interval);
        }

        /// Expects the alarm byte to have been drained already.
        pub fn on_tick<D, C>(&self, timers: &mut TimerList<D, C>, ctx: &mut C) -> usize {
            let now = self.clock.now();
            let fired = timers.advance(now, ctx);
            log::trace!("tick at [{}] fired [{}], [{}] still tracked", now, fired, timers.len());
            self.alarm.arm(self.interval);
            fired
        }
    }
}
