use std::time::Duration;

use crate::timer_list::Timestamp;

#[derive(Clone, Debug)]
pub struct ReaperConfig {
    tick_interval: Duration,
    idle_timeout: Duration,
    edge_triggered: bool,
    one_shot: bool,
    restart_syscalls: bool,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        let tick_interval = Duration::from_secs(5);
        Self {
            tick_interval,
            idle_timeout: tick_interval * 3,
            edge_triggered: false,
            one_shot: true,
            restart_syscalls: true,
        }
    }
}

impl ReaperConfig {
    pub fn new() -> Self {
        Self::default()
    }
    /// Alarm period. `alarm(2)` only has whole-second resolution, so anything
    /// under a second is armed as one second.
    pub fn get_tick_interval(&self) -> Duration {
        self.tick_interval
    }
    /// How far a connection's deadline is pushed on accept and on every touch.
    pub fn get_idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
    pub(crate) fn idle_timeout_secs(&self) -> Timestamp {
        Timestamp::try_from(self.idle_timeout.as_secs()).unwrap_or(Timestamp::MAX)
    }
    pub fn is_edge_triggered(&self) -> bool {
        self.edge_triggered
    }
    pub fn is_one_shot(&self) -> bool {
        self.one_shot
    }
    pub fn restarts_syscalls(&self) -> bool {
        self.restart_syscalls
    }

    pub fn tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
    pub fn edge_triggered(mut self, edge_triggered: bool) -> Self {
        self.edge_triggered = edge_triggered;
        self
    }
    pub fn one_shot(mut self, one_shot: bool) -> Self {
        self.one_shot = one_shot;
        self
    }
    pub fn restart_syscalls(mut self, restart: bool) -> Self {
        self.restart_syscalls = restart;
        self
    }
}
