use std::{
    net::SocketAddr,
    os::fd::{AsRawFd, OwnedFd, RawFd},
};

use crossbeam_channel::Receiver;

use crate::{
    config::ReaperConfig,
    connection::{ClientData, ReapReason, Reaped, ServerContext, on_expire},
    driver::{Alarm, Clock, SigAlarm, TickDriver, WallClock},
    errors::IdleClockError,
    registry::{self, Epoll},
    signal::{self, LoopSignals, Notification},
    timer_list::{Timer, TimerHandle, TimerList, Timestamp},
};

/// Idle-connection bookkeeping for one server loop.
///
/// Wires accepted sockets into the readiness registry, gives each one a
/// deadline in the timer list and tears it down when the deadline passes.
/// Everything here runs on the loop thread; the signal side only ever writes
/// bytes to the [`NotifyPipe`](crate::signal::NotifyPipe).
pub struct IdleReaper<K: Clock = WallClock, A: Alarm = SigAlarm> {
    timers: TimerList<RawFd, ServerContext>,
    ctx: ServerContext,
    driver: TickDriver<K, A>,
    config: ReaperConfig,
}

impl IdleReaper {
    pub fn new(config: ReaperConfig, registry: Epoll) -> Self {
        Self::with_driver(config, registry, WallClock, SigAlarm)
    }
}

impl<K: Clock, A: Alarm> IdleReaper<K, A> {
    pub fn with_driver(config: ReaperConfig, registry: Epoll, clock: K, alarm: A) -> Self {
        let driver = TickDriver::new(clock, alarm, config.get_tick_interval());
        Self {
            timers: TimerList::new(),
            ctx: ServerContext::new(registry),
            driver,
            config,
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }
    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }
    pub fn timers(&self) -> &TimerList<RawFd, ServerContext> {
        &self.timers
    }
    pub fn user_count(&self) -> usize {
        self.ctx.user_count()
    }

    /// Receives one [`Reaped`] per connection torn down from now on.
    pub fn subscribe(&mut self) -> Receiver<Reaped> {
        self.ctx.subscribe()
    }

    /// Funnels `signals` into the notification channel, honouring the
    /// configured `SA_RESTART` setting. Aborts if a handler cannot be installed.
    pub fn install_signals(&self, signals: &[libc::c_int]) {
        for sig in signals {
            signal::register_signal(*sig, signal::on_signal, self.config.restarts_syscalls());
        }
    }

    /// Arms the first alarm.
    pub fn start(&self) {
        self.driver.start();
    }

    /// Registers a freshly accepted socket and starts its idle deadline.
    ///
    /// The socket is added to the readiness registry with the configured
    /// trigger mode, switched to non-blocking, and given a timer expiring
    /// at now + idle timeout. The reaper owns the socket from here on: it is
    /// closed by [`close`](Self::close) or when the timer fires.
    ///
    /// When registration fails the socket is dropped (closed) right away: a
    /// descriptor the loop cannot see would never be served nor reaped.
    ///
    /// ### Example
    /// ```rust
    /// use std::os::{fd::OwnedFd, unix::net::UnixStream};
    /// use idle_clock::{IdleReaper, ManualClock, ReaperConfig, SigAlarm, registry::Epoll};
    ///
    /// let clock = ManualClock::new(100);
    /// let mut reaper =
    ///     IdleReaper::with_driver(ReaperConfig::default(), Epoll::new()?, &clock, SigAlarm);
    ///
    /// let (server, _client) = UnixStream::pair()?;
    /// let handle = reaper.accept(OwnedFd::from(server), None)?;
    ///
    /// assert_eq!(reaper.timers().expire(handle), Some(115));
    /// assert_eq!(reaper.user_count(), 1);
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn accept(
        &mut self,
        socket: OwnedFd,
        peer: Option<SocketAddr>,
    ) -> Result<TimerHandle, IdleClockError> {
        let fd = socket.as_raw_fd();
        registry::register_for_readiness(
            &self.ctx.registry,
            fd,
            self.config.is_one_shot(),
            self.config.is_edge_triggered(),
        )?;

        let expire = self.deadline();
        let handle = self.timers.insert(Timer::new(expire, on_expire, fd));
        let mut client = ClientData::new(socket, peer);
        client.set_timer(Some(handle));

        if let Some(stale) = self.ctx.connections.insert(fd, client) {
            // the kernel reused the number, so the old socket is already gone
            // and the live registration belongs to the new one
            log::warn!("fd [{}] reused while still tracked, dropping stale entry", fd);
            if let Some(timer) = stale.forget_socket() {
                self.timers.remove(timer);
            }
            self.ctx.user_count = self.ctx.user_count.saturating_sub(1);
        }
        self.ctx.user_count += 1;
        log::debug!("connection fd [{}] tracked until [{}]", fd, expire);
        Ok(handle)
    }

    /// Pushes the connection's deadline to now + idle timeout.
    ///
    /// Call this whenever the connection shows activity. The timer is moved
    /// toward the tail of the list in place; its handle stays valid. Returns
    /// the new deadline.
    ///
    /// ### Example
    /// ```rust
    /// use std::os::{fd::{AsRawFd, OwnedFd}, unix::net::UnixStream};
    /// use idle_clock::{IdleReaper, ManualClock, ReaperConfig, SigAlarm, registry::Epoll};
    ///
    /// let clock = ManualClock::new(100);
    /// let mut reaper =
    ///     IdleReaper::with_driver(ReaperConfig::default(), Epoll::new()?, &clock, SigAlarm);
    /// let (server, _client) = UnixStream::pair()?;
    /// let fd = server.as_raw_fd();
    /// reaper.accept(OwnedFd::from(server), None)?;
    ///
    /// clock.advance(10);
    /// assert_eq!(reaper.touch(fd)?, 125);
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn touch(&mut self, fd: RawFd) -> Result<Timestamp, IdleClockError> {
        let handle = self
            .ctx
            .connection(fd)
            .and_then(|c| c.timer())
            .ok_or(IdleClockError::UnknownConnection(fd))?;
        let expire = self.deadline();
        if !self.timers.set_expire(handle, expire) {
            return Err(IdleClockError::UnknownConnection(fd));
        }
        Ok(expire)
    }

    /// Re-enables a one-shot registration once the connection has been served.
    pub fn rearm(&self, fd: RawFd) -> Result<(), IdleClockError> {
        if self.ctx.connection(fd).is_none() {
            return Err(IdleClockError::UnknownConnection(fd));
        }
        registry::rearm(
            &self.ctx.registry,
            fd,
            self.config.is_one_shot(),
            self.config.is_edge_triggered(),
        )
    }

    /// Graceful close of a connection the peer or the protocol ended.
    ///
    /// The timer is cancelled, then the descriptor is deregistered and
    /// closed, the connection counter decremented and subscribers notified
    /// with [`ReapReason::Closed`]. Unknown descriptors are an error, so a
    /// double close is reported rather than acted on.
    pub fn close(&mut self, fd: RawFd) -> Result<(), IdleClockError> {
        let client = self
            .ctx
            .connections
            .remove(&fd)
            .ok_or(IdleClockError::UnknownConnection(fd))?;
        if let Some(timer) = client.timer() {
            self.timers.remove(timer);
        }
        log::debug!("connection fd [{}] closed", fd);
        let reaped = Reaped {
            fd,
            peer: client.peer(),
            reason: ReapReason::Closed,
        };
        self.ctx.teardown(fd, client, reaped);
        Ok(())
    }

    /// Runs the periodic driver; returns how many connections expired.
    pub fn tick(&mut self) -> usize {
        self.driver.on_tick(&mut self.timers, &mut self.ctx)
    }

    /// Folds a drained notification batch and ticks once if it held an alarm.
    pub fn handle_notifications(&mut self, notifications: &[Notification]) -> LoopSignals {
        let signals = LoopSignals::from_notifications(notifications);
        if signals.timeout {
            self.tick();
        }
        signals
    }

    /// Expires every tracked connection now, for shutdown.
    pub fn expire_all(&mut self) -> usize {
        self.timers.advance(Timestamp::MAX, &mut self.ctx)
    }

    fn deadline(&self) -> Timestamp {
        self.driver
            .now()
            .saturating_add(self.config.idle_timeout_secs())
    }
}
