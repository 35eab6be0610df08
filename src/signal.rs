pub use bridge::{SignalHandler, on_signal, register_signal, try_register_signal};
pub use channel::NotifyPipe;
pub use notification::{LoopSignals, Notification};

/// Write end of the live [`NotifyPipe`], or -1 when none is open.
///
/// An atomic load is the only shared state the handler touches.
static NOTIFY_WRITE_FD: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(-1);

mod bridge {
    use std::{io, sync::atomic::Ordering};

    use crate::errors::IdleClockError;

    use super::NOTIFY_WRITE_FD;

    pub type SignalHandler = extern "C" fn(libc::c_int);

    /// Signal handler that forwards the signal number as one byte on the
    /// notification channel.
    ///
    /// Runs at arbitrary interruption points, so it only loads an atomic,
    /// issues a single non-blocking `send(2)` and restores `errno`. It never
    /// allocates and never touches the timer list. The dispatch happens later
    /// on the loop thread once the byte has been read back.
    pub extern "C" fn on_signal(signal: libc::c_int) {
        unsafe {
            let errno = libc::__errno_location();
            let saved_errno = *errno;

            let fd = NOTIFY_WRITE_FD.load(Ordering::Relaxed);
            if fd >= 0 {
                let msg = signal as u8;
                libc::send(
                    fd,
                    &msg as *const u8 as *const libc::c_void,
                    1,
                    libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
                );
            }

            *errno = saved_errno;
        }
    }

    /// Installs `handler` for `signal` with every other signal blocked while it
    /// runs. `restart` sets `SA_RESTART`.
    pub fn try_register_signal(
        signal: libc::c_int,
        handler: SignalHandler,
        restart: bool,
    ) -> Result<(), IdleClockError> {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = handler as *const () as libc::sighandler_t;
        if restart {
            action.sa_flags |= libc::SA_RESTART;
        }
        unsafe {
            libc::sigfillset(&mut action.sa_mask);
        }

        if unsafe { libc::sigaction(signal, &action, std::ptr::null_mut()) } == -1 {
            return Err(IdleClockError::SignalInstall {
                signal,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Startup-time variant: a server that cannot install its handlers has no
    /// way to expire connections, so failure aborts the process.
    pub fn register_signal(signal: libc::c_int, handler: SignalHandler, restart: bool) {
        if let Err(e) = try_register_signal(signal, handler, restart) {
            log::error!("{}", e);
            std::process::abort();
        }
    }
}

mod channel {
    use std::{
        io::{self, Read},
        os::{
            fd::{AsRawFd, RawFd},
            unix::net::UnixStream,
        },
        sync::atomic::Ordering,
    };

    use crate::errors::IdleClockError;

    use super::{NOTIFY_WRITE_FD, Notification};

    /// Self-pipe between [`on_signal`](super::on_signal) and the loop.
    ///
    /// A socket pair, both ends non-blocking. The write end is published to
    /// the handler on `open` and withdrawn on drop; at most one pipe is live per
    /// process, opening a second one redirects the handler to it.
    #[derive(Debug)]
    pub struct NotifyPipe {
        reader: UnixStream,
        writer: UnixStream,
    }

    impl NotifyPipe {
        pub fn open() -> Result<Self, IdleClockError> {
            let (reader, writer) = UnixStream::pair()?;
            reader.set_nonblocking(true)?;
            writer.set_nonblocking(true)?;
            NOTIFY_WRITE_FD.store(writer.as_raw_fd(), Ordering::SeqCst);
            Ok(Self { reader, writer })
        }

        /// Descriptor the server registers (level-triggered, not one-shot).
        pub fn read_fd(&self) -> RawFd {
            self.reader.as_raw_fd()
        }

        /// Reads every pending byte without blocking.
        pub fn drain(&mut self) -> io::Result<Vec<Notification>> {
            let mut notifications = vec![];
            let mut buf = [0u8; 1024];
            loop {
                match self.reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => notifications
                        .extend(buf[..n].iter().map(|b| Notification::from_signal(*b as i32))),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(notifications)
        }
    }

    impl Drop for NotifyPipe {
        fn drop(&mut self) {
            let _ = NOTIFY_WRITE_FD.compare_exchange(
                self.writer.as_raw_fd(),
                -1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}

mod notification {
    use std::fmt::Display;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Notification {
        /// `SIGALRM`: time to run the periodic driver.
        Alarm,
        /// `SIGTERM` or `SIGINT`.
        Terminate,
        Other(i32),
    }

    impl Notification {
        pub fn from_signal(signal: i32) -> Self {
            match signal {
                libc::SIGALRM => Self::Alarm,
                libc::SIGTERM | libc::SIGINT => Self::Terminate,
                other => Self::Other(other),
            }
        }
    }

    impl Display for Notification {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Alarm => write!(f, "alarm"),
                Self::Terminate => write!(f, "terminate"),
                Self::Other(sig) => write!(f, "signal [{}]", sig),
            }
        }
    }

    /// What one drained batch asks of the loop. Several alarms coalesced into a
    /// single read still mean a single tick.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct LoopSignals {
        pub timeout: bool,
        pub stop: bool,
    }

    impl LoopSignals {
        pub fn from_notifications(notifications: &[Notification]) -> Self {
            notifications
                .iter()
                .fold(Self::default(), |mut signals, n| {
                    match n {
                        Notification::Alarm => signals.timeout = true,
                        Notification::Terminate => signals.stop = true,
                        Notification::Other(sig) => {
                            log::debug!("ignoring notification for signal [{}]", sig)
                        }
                    }
                    signals
                })
        }
    }
}
