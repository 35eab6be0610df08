use std::{
    cell::RefCell,
    io::{Read, Write},
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd},
        unix::net::UnixStream,
    },
    time::Duration,
};

use crate::{
    config::ReaperConfig,
    connection::ReapReason,
    driver::{Alarm, ManualClock},
    errors::IdleClockError,
    reaper::IdleReaper,
    registry::{self, Epoll},
    signal::{self, LoopSignals, Notification, NotifyPipe},
    timer_list::{Timer, TimerHandle, TimerList, Timestamp},
};

type List = TimerList<u32, Vec<u32>>;

fn record(fired: &mut Vec<u32>, id: u32) {
    fired.push(id);
}

fn timer(expire: Timestamp, id: u32) -> Timer<u32, Vec<u32>> {
    Timer::new(expire, record, id)
}

fn ids(list: &List) -> Vec<u32> {
    list.iter().map(|(_, _, id)| *id).collect()
}

fn expiries(list: &List) -> Vec<Timestamp> {
    list.iter().map(|(_, expire, _)| expire).collect()
}

/// Small deterministic generator, enough to shuffle deadlines.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

#[test]
fn test_insert_keeps_fifo_order_for_equal_deadlines() {
    let mut list = List::new();
    for (id, expire) in [5, 2, 8, 2].into_iter().enumerate() {
        list.insert(timer(expire, id as u32));
        list.assert_linked();
    }
    assert_eq!(expiries(&list), vec![2, 2, 5, 8]);
    assert_eq!(ids(&list), vec![1, 3, 0, 2]);
    assert_eq!(list.next_expire(), Some(2));
}

#[test]
fn test_insert_stays_sorted_against_stable_sort() {
    let mut rng = Lcg(7);
    let mut list = List::new();
    let mut reference: Vec<(Timestamp, u32)> = vec![];
    for id in 0..300 {
        let expire = rng.next(40) as Timestamp;
        list.insert(timer(expire, id));
        reference.push((expire, id));
        list.assert_linked();
    }
    reference.sort_by_key(|(expire, _)| *expire);
    let listed: Vec<(Timestamp, u32)> = list.iter().map(|(_, e, id)| (e, *id)).collect();
    assert_eq!(listed, reference);
}

#[test]
fn test_advance_fires_expired_in_order() {
    let mut list = List::new();
    list.insert(timer(2, 20));
    list.insert(timer(8, 80));
    list.insert(timer(5, 50));

    let mut fired = vec![];
    assert_eq!(list.advance(6, &mut fired), 2);
    assert_eq!(fired, vec![20, 50]);
    assert_eq!(expiries(&list), vec![8]);
    assert_eq!(list.next_expire(), Some(8));
    list.assert_linked();
}

#[test]
fn test_advance_fires_deadline_equal_to_now() {
    let mut list = List::new();
    list.insert(timer(6, 1));
    list.insert(timer(7, 2));

    let mut fired = vec![];
    list.advance(6, &mut fired);
    assert_eq!(fired, vec![1]);
    assert_eq!(ids(&list), vec![2]);
}

#[test]
fn test_advance_on_empty_and_future_lists() {
    let mut list = List::new();
    let mut fired = vec![];
    assert_eq!(list.advance(100, &mut fired), 0);

    list.insert(timer(50, 1));
    assert_eq!(list.advance(49, &mut fired), 0);
    assert!(fired.is_empty());
    assert_eq!(list.len(), 1);
}

#[test]
fn test_each_timer_fires_at_most_once() {
    let mut list = List::new();
    let handles: Vec<TimerHandle> = (0..5).map(|id| list.insert(timer(id as Timestamp, id))).collect();

    let mut fired = vec![];
    list.advance(10, &mut fired);
    list.advance(10, &mut fired);
    assert_eq!(fired, vec![0, 1, 2, 3, 4]);
    assert!(list.is_empty());
    list.assert_linked();

    for handle in handles {
        assert!(!list.contains(handle));
        assert!(list.remove(handle).is_none());
    }
}

#[test]
fn test_reposition_moves_head_behind_successor() {
    let mut list = List::new();
    let head = list.insert(timer(10, 1));
    list.insert(timer(15, 2));

    *list.expire_mut(head).unwrap() = 20;
    assert!(list.reposition(head));
    assert_eq!(expiries(&list), vec![15, 20]);
    assert_eq!(ids(&list), vec![2, 1]);
    list.assert_linked();
}

#[test]
fn test_reposition_is_noop_while_before_successor() {
    let mut list = List::new();
    list.insert(timer(5, 1));
    let middle = list.insert(timer(10, 2));
    list.insert(timer(15, 3));

    assert!(list.set_expire(middle, 14));
    assert_eq!(ids(&list), vec![1, 2, 3]);
    assert_eq!(list.expire(middle), Some(14));
}

#[test]
fn test_reposition_goes_behind_equal_successors() {
    let mut list = List::new();
    let first = list.insert(timer(10, 1));
    list.insert(timer(12, 2));
    list.insert(timer(12, 3));

    list.set_expire(first, 12);
    assert_eq!(ids(&list), vec![2, 3, 1]);
    list.assert_linked();
}

#[test]
fn test_reposition_handles_decreased_deadline() {
    let mut list = List::new();
    list.insert(timer(5, 1));
    list.insert(timer(10, 2));
    let tail = list.insert(timer(15, 3));

    list.set_expire(tail, 1);
    assert_eq!(ids(&list), vec![3, 1, 2]);
    assert_eq!(list.next_expire(), Some(1));
    list.assert_linked();
}

#[test]
fn test_reposition_matches_remove_and_reinsert() {
    let mut rng = Lcg(42);
    let mut repositioned = List::new();
    let mut reinserted = List::new();
    let mut handles_a = vec![];
    let mut handles_b = vec![];
    for id in 0..64 {
        let expire = rng.next(30) as Timestamp;
        handles_a.push(repositioned.insert(timer(expire, id)));
        handles_b.push(reinserted.insert(timer(expire, id)));
    }

    for _ in 0..500 {
        let id = rng.next(64) as usize;
        let bump = rng.next(10) as Timestamp;
        let expire = repositioned.expire(handles_a[id]).unwrap() + bump;

        repositioned.set_expire(handles_a[id], expire);

        let mut old = reinserted.remove(handles_b[id]).unwrap();
        old.expire = expire;
        handles_b[id] = reinserted.insert(old);

        repositioned.assert_linked();
        let a: Vec<(Timestamp, u32)> = repositioned.iter().map(|(_, e, id)| (e, *id)).collect();
        let b: Vec<(Timestamp, u32)> = reinserted.iter().map(|(_, e, id)| (e, *id)).collect();
        assert_eq!(a, b);
    }
}

#[test]
fn test_remove_singleton_empties_list() {
    let mut list = List::new();
    let only = list.insert(timer(3, 1));

    let removed = list.remove(only).unwrap();
    assert_eq!(removed.expire, 3);
    assert_eq!(removed.data, 1);
    assert!(list.is_empty());
    assert_eq!(list.next_expire(), None);
    assert_eq!(list.iter().count(), 0);
    list.assert_linked();
}

#[test]
fn test_remove_head_tail_and_interior() {
    let mut list = List::new();
    let handles: Vec<TimerHandle> = (0..5).map(|id| list.insert(timer(id as Timestamp, id))).collect();

    list.remove(handles[2]);
    list.assert_linked();
    assert_eq!(ids(&list), vec![0, 1, 3, 4]);

    list.remove(handles[0]);
    list.assert_linked();
    assert_eq!(ids(&list), vec![1, 3, 4]);

    list.remove(handles[4]);
    list.assert_linked();
    assert_eq!(ids(&list), vec![1, 3]);

    let mut fired = vec![];
    list.advance(10, &mut fired);
    assert_eq!(fired, vec![1, 3]);
}

#[test]
fn test_stale_handle_does_not_alias_reused_slot() {
    let mut list = List::new();
    let old = list.insert(timer(1, 1));
    assert!(list.remove(old).is_some());

    let new = list.insert(timer(2, 2));
    assert_ne!(old, new);
    assert!(!list.contains(old));
    assert!(list.remove(old).is_none());
    assert!(!list.reposition(old));
    assert!(!list.set_expire(old, 99));
    assert_eq!(list.data(new), Some(&2));
    assert_eq!(list.len(), 1);
}

#[test]
fn test_clear_drops_without_firing() {
    let mut list = List::new();
    for id in 0..4 {
        list.insert(timer(id, id as u32));
    }
    list.clear();
    assert!(list.is_empty());
    list.assert_linked();

    let mut fired = vec![];
    list.advance(Timestamp::MAX, &mut fired);
    assert!(fired.is_empty());
}

#[test]
fn test_make_non_blocking_returns_previous_flags() {
    let (a, _b) = UnixStream::pair().unwrap();
    let fd = a.as_raw_fd();

    let before = registry::make_non_blocking(fd).unwrap();
    assert_eq!(before & libc::O_NONBLOCK, 0);
    let after = registry::make_non_blocking(fd).unwrap();
    assert_ne!(after & libc::O_NONBLOCK, 0);
}

#[test]
fn test_readiness_mask() {
    let level = registry::readiness_mask(false, false);
    assert_eq!(level, (libc::EPOLLIN | libc::EPOLLRDHUP) as u32);

    let all = registry::readiness_mask(true, true);
    assert_ne!(all & libc::EPOLLET as u32, 0);
    assert_ne!(all & libc::EPOLLONESHOT as u32, 0);
}

#[test]
fn test_one_shot_registration_needs_rearm() {
    let epoll = Epoll::new().unwrap();
    let (server, mut client) = UnixStream::pair().unwrap();
    let fd = server.as_raw_fd();
    registry::register_for_readiness(&epoll, fd, true, false).unwrap();

    client.write_all(b"ping").unwrap();
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
    assert_eq!(epoll.wait(&mut events, 1000).unwrap(), 1);
    let ready = events[0];
    let (data, flags) = (ready.u64, ready.events);
    assert_eq!(data, fd as u64);
    assert_ne!(flags & libc::EPOLLIN as u32, 0);

    assert_eq!(epoll.wait(&mut events, 0).unwrap(), 0);
    registry::rearm(&epoll, fd, true, false).unwrap();
    assert_eq!(epoll.wait(&mut events, 1000).unwrap(), 1);
}

#[test]
fn test_register_invalid_fd_reports_registration_error() {
    let epoll = Epoll::new().unwrap();
    let err = registry::register_for_readiness(&epoll, -1, true, false).unwrap_err();
    assert!(matches!(err, IdleClockError::Registration { fd: -1, .. }));
}

#[test]
fn test_signal_bridge_writes_signal_byte() {
    let mut pipe = NotifyPipe::open().unwrap();
    assert!(pipe.drain().unwrap().is_empty());

    signal::try_register_signal(libc::SIGUSR1, signal::on_signal, true).unwrap();
    signal::try_register_signal(libc::SIGALRM, signal::on_signal, true).unwrap();

    unsafe {
        *libc::__errno_location() = libc::ENOTTY;
        libc::raise(libc::SIGUSR1);
        assert_eq!(*libc::__errno_location(), libc::ENOTTY);
        libc::raise(libc::SIGALRM);
    }

    assert_eq!(
        pipe.drain().unwrap(),
        vec![Notification::Other(libc::SIGUSR1), Notification::Alarm]
    );
    assert!(pipe.drain().unwrap().is_empty());
}

#[test]
fn test_loop_signals_fold() {
    let signals = LoopSignals::from_notifications(&[
        Notification::Alarm,
        Notification::Other(libc::SIGUSR2),
        Notification::Alarm,
    ]);
    assert_eq!(
        signals,
        LoopSignals {
            timeout: true,
            stop: false
        }
    );

    let signals = LoopSignals::from_notifications(&[Notification::from_signal(libc::SIGTERM)]);
    assert!(signals.stop && !signals.timeout);
    assert_eq!(Notification::from_signal(libc::SIGINT), Notification::Terminate);
}

#[test]
fn test_config_defaults_and_builder() {
    let config = ReaperConfig::default();
    assert_eq!(config.get_tick_interval(), Duration::from_secs(5));
    assert_eq!(config.get_idle_timeout(), Duration::from_secs(15));
    assert!(config.is_one_shot() && !config.is_edge_triggered() && config.restarts_syscalls());

    let config = ReaperConfig::new()
        .tick_interval(Duration::from_secs(1))
        .idle_timeout(Duration::from_secs(3))
        .edge_triggered(true);
    assert_eq!(config.idle_timeout_secs(), 3);
    assert!(config.is_edge_triggered());
}

#[derive(Default)]
struct RecordingAlarm {
    armed: RefCell<Vec<Duration>>,
}

impl Alarm for RecordingAlarm {
    fn arm(&self, after: Duration) {
        self.armed.borrow_mut().push(after);
    }
}

fn connection() -> (OwnedFd, UnixStream) {
    let (server, client) = UnixStream::pair().unwrap();
    (OwnedFd::from(server), client)
}

fn reaper<'a>(
    clock: &'a ManualClock,
    alarm: &'a RecordingAlarm,
) -> IdleReaper<&'a ManualClock, &'a RecordingAlarm> {
    let config = ReaperConfig::new()
        .tick_interval(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(15));
    IdleReaper::with_driver(config, Epoll::new().unwrap(), clock, alarm)
}

#[test]
fn test_accept_tracks_connection() {
    let clock = ManualClock::new(100);
    let alarm = RecordingAlarm::default();
    let mut reaper = reaper(&clock, &alarm);

    let (server, _client) = connection();
    let fd = server.as_raw_fd();
    let handle = reaper.accept(server, None).unwrap();

    assert_eq!(reaper.user_count(), 1);
    assert_eq!(reaper.timers().expire(handle), Some(115));
    assert_eq!(reaper.context().connection(fd).unwrap().timer(), Some(handle));
    assert!(alarm.armed.borrow().is_empty());
}

#[test]
fn test_alarm_expires_idle_connection() {
    let clock = ManualClock::new(100);
    let alarm = RecordingAlarm::default();
    let mut reaper = reaper(&clock, &alarm);
    let expired = reaper.subscribe();

    let (server, mut client) = connection();
    let fd = server.as_raw_fd();
    reaper.accept(server, None).unwrap();

    clock.set(114);
    reaper.handle_notifications(&[Notification::Alarm]);
    assert_eq!(reaper.user_count(), 1);

    clock.set(115);
    let signals = reaper.handle_notifications(&[Notification::Alarm]);
    assert!(signals.timeout);
    assert_eq!(reaper.user_count(), 0);
    assert!(reaper.timers().is_empty());
    assert!(reaper.context().connection(fd).is_none());

    let event = expired.try_recv().unwrap();
    assert_eq!(event.fd, fd);
    assert_eq!(event.reason, ReapReason::IdleTimeout);

    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
    assert_eq!(*alarm.armed.borrow(), vec![Duration::from_secs(5); 2]);
}

#[test]
fn test_touch_keeps_active_connection_alive() {
    let clock = ManualClock::new(100);
    let alarm = RecordingAlarm::default();
    let mut reaper = reaper(&clock, &alarm);
    let expired = reaper.subscribe();

    let (idle, _idle_client) = connection();
    let (active, _active_client) = connection();
    let idle_fd = idle.as_raw_fd();
    let active_fd = active.as_raw_fd();
    reaper.accept(active, None).unwrap();
    reaper.accept(idle, None).unwrap();

    clock.advance(10);
    assert_eq!(reaper.touch(active_fd).unwrap(), 125);
    let order: Vec<i32> = reaper.timers().iter().map(|(_, _, fd)| *fd).collect();
    assert_eq!(order, vec![idle_fd, active_fd]);

    clock.advance(5);
    assert_eq!(reaper.tick(), 1);
    assert_eq!(expired.try_recv().unwrap().fd, idle_fd);
    assert!(expired.try_recv().is_err());
    assert!(reaper.context().connection(active_fd).is_some());
    assert_eq!(reaper.user_count(), 1);
}

#[test]
fn test_close_removes_timer_before_teardown() {
    let clock = ManualClock::new(0);
    let alarm = RecordingAlarm::default();
    let mut reaper = reaper(&clock, &alarm);
    let reaped = reaper.subscribe();

    let (server, mut client) = connection();
    let fd = server.as_raw_fd();
    reaper.accept(server, None).unwrap();
    reaper.close(fd).unwrap();

    assert!(reaper.timers().is_empty());
    assert_eq!(reaper.user_count(), 0);
    assert_eq!(reaped.try_recv().unwrap().reason, ReapReason::Closed);
    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap(), 0);

    clock.advance(100);
    assert_eq!(reaper.tick(), 0);
    assert!(matches!(
        reaper.close(fd),
        Err(IdleClockError::UnknownConnection(_))
    ));
    assert!(matches!(
        reaper.touch(fd),
        Err(IdleClockError::UnknownConnection(_))
    ));
}

#[test]
fn test_terminate_does_not_tick() {
    let clock = ManualClock::new(1000);
    let alarm = RecordingAlarm::default();
    let mut reaper = reaper(&clock, &alarm);
    let (server, _client) = connection();
    reaper.accept(server, None).unwrap();

    clock.advance(1000);
    let signals = reaper.handle_notifications(&[Notification::Terminate]);
    assert!(signals.stop && !signals.timeout);
    assert_eq!(reaper.user_count(), 1);
    assert!(alarm.armed.borrow().is_empty());

    assert_eq!(reaper.expire_all(), 1);
    assert_eq!(reaper.user_count(), 0);
}

#[test]
fn test_rearm_tracked_connection() {
    let clock = ManualClock::new(0);
    let alarm = RecordingAlarm::default();
    let mut reaper = reaper(&clock, &alarm);
    let (server, _client) = connection();
    let fd = server.as_raw_fd();
    reaper.accept(server, None).unwrap();

    reaper.rearm(fd).unwrap();
    reaper.install_signals(&[libc::SIGUSR2]);
    reaper.start();
    assert_eq!(alarm.armed.borrow().len(), 1);
    assert!(matches!(
        reaper.rearm(-1),
        Err(IdleClockError::UnknownConnection(-1))
    ));
}

#[test]
fn test_handles_resolve_to_their_own_timer() {
    let mut list = List::new();
    let mut seen = std::collections::HashSet::new();
    let mut previous: Vec<TimerHandle> = vec![];
    for round in 0..4u32 {
        let handles: Vec<TimerHandle> = (0..50)
            .map(|id| list.insert(timer(id as Timestamp, round * 100 + id)))
            .collect();
        for (id, handle) in handles.iter().enumerate() {
            assert!(seen.insert(*handle));
            assert_eq!(list.data(*handle), Some(&(round * 100 + id as u32)));
        }
        for stale in &previous {
            assert!(!list.contains(*stale));
        }
        list.clear();
        previous = handles;
    }
}

#[test]
fn test_deregister_reports_untracked_fd() {
    let epoll = Epoll::new().unwrap();
    let (server, _client) = UnixStream::pair().unwrap();
    let fd = server.as_raw_fd();
    registry::register_for_readiness(&epoll, fd, false, false).unwrap();

    registry::deregister(&epoll, fd).unwrap();
    assert!(matches!(
        registry::deregister(&epoll, fd),
        Err(IdleClockError::Registration { .. })
    ));
}

#[test]
fn test_accept_rejects_socket_it_cannot_register() {
    let clock = ManualClock::new(0);
    let alarm = RecordingAlarm::default();
    let mut reaper = reaper(&clock, &alarm);

    let (server, mut client) = connection();
    let fd = server.as_raw_fd();
    reaper
        .context()
        .registry()
        .add(fd, registry::readiness_mask(false, false))
        .unwrap();

    let err = reaper.accept(server, None).unwrap_err();
    assert!(matches!(err, IdleClockError::Registration { .. }));
    assert_eq!(reaper.user_count(), 0);
    assert!(reaper.timers().is_empty());
    assert!(reaper.context().connection(fd).is_none());

    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_accept_reused_fd_keeps_new_socket_open() {
    let clock = ManualClock::new(0);
    let alarm = RecordingAlarm::default();
    let mut reaper = reaper(&clock, &alarm);

    let (first, _first_client) = connection();
    let fd = first.as_raw_fd();
    reaper.accept(first, None).unwrap();

    // make `fd` name a different socket, as if the first one had been
    // closed elsewhere and the number handed out again
    let (second, mut second_client) = UnixStream::pair().unwrap();
    assert_eq!(unsafe { libc::dup2(second.as_raw_fd(), fd) }, fd);
    drop(second);
    let reused = unsafe { OwnedFd::from_raw_fd(fd) };

    reaper.accept(reused, None).unwrap();
    assert_ne!(unsafe { libc::fcntl(fd, libc::F_GETFD) }, -1);
    assert_eq!(reaper.user_count(), 1);
    assert_eq!(reaper.timers().len(), 1);

    second_client.write_all(b"ping").unwrap();
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
    assert_eq!(reaper.context().registry().wait(&mut events, 1000).unwrap(), 1);

    reaper.close(fd).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(second_client.read(&mut buf).unwrap(), 0);
}
