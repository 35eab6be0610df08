pub use client_data::ClientData;
pub use context::ServerContext;
pub use expire::on_expire;
pub use reaped::{ReapReason, Reaped};

mod client_data {
    use std::{
        net::SocketAddr,
        os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd},
    };

    use crate::timer_list::TimerHandle;

    /// Per-connection context the server keeps while a client is connected.
    ///
    /// Owns the socket, so dropping it closes the descriptor. `timer` is a
    /// handle into the timer list, never the timer itself.
    #[derive(Debug)]
    pub struct ClientData {
        socket: OwnedFd,
        peer: Option<SocketAddr>,
        timer: Option<TimerHandle>,
    }

    impl ClientData {
        pub fn new(socket: OwnedFd, peer: Option<SocketAddr>) -> Self {
            Self {
                socket,
                peer,
                timer: None,
            }
        }
        pub fn socket_fd(&self) -> RawFd {
            self.socket.as_raw_fd()
        }
        pub fn peer(&self) -> Option<SocketAddr> {
            self.peer
        }
        pub fn timer(&self) -> Option<TimerHandle> {
            self.timer
        }
        pub(crate) fn set_timer(&mut self, timer: Option<TimerHandle>) {
            self.timer = timer;
        }
        /// Gives up ownership of a descriptor that was closed behind our back
        /// and whose number now belongs to another socket. Nothing is closed.
        pub(crate) fn forget_socket(self) -> Option<TimerHandle> {
            let _ = self.socket.into_raw_fd();
            self.timer
        }
    }
}

mod context {
    use std::{collections::HashMap, os::fd::RawFd};

    use crossbeam_channel::{Receiver, Sender};

    use crate::registry::{self, Epoll};

    use super::{ClientData, Reaped};

    /// Everything the expiry callback is allowed to touch: the readiness
    /// registry, the connection table and the connection counter.
    pub struct ServerContext {
        pub(crate) registry: Epoll,
        pub(crate) connections: HashMap<RawFd, ClientData>,
        pub(crate) user_count: usize,
        subscribers: Vec<Sender<Reaped>>,
    }

    impl ServerContext {
        pub fn new(registry: Epoll) -> Self {
            Self {
                registry,
                connections: HashMap::new(),
                user_count: 0,
                subscribers: vec![],
            }
        }
        pub fn registry(&self) -> &Epoll {
            &self.registry
        }
        pub fn connection(&self, fd: RawFd) -> Option<&ClientData> {
            self.connections.get(&fd)
        }
        pub fn user_count(&self) -> usize {
            self.user_count
        }

        pub(crate) fn subscribe(&mut self) -> Receiver<Reaped> {
            let (sender, receiver) = crossbeam_channel::unbounded();
            self.subscribers.push(sender);
            receiver
        }

        /// Deregisters and closes a connection already taken out of the table.
        pub(crate) fn teardown(&mut self, fd: RawFd, client: ClientData, reaped: Reaped) {
            // failure is already logged, the socket goes either way
            let _ = registry::deregister(&self.registry, fd);
            drop(client);
            self.user_count = self.user_count.saturating_sub(1);

            // a dropped receiver unsubscribes
            self.subscribers.retain(|s| s.send(reaped).is_ok());
        }
    }
}

mod expire {
    use std::os::fd::RawFd;

    use super::{ReapReason, Reaped, ServerContext};

    /// Timer callback for an idle connection: deregister, close, decrement.
    ///
    /// Only ever invoked from `TimerList::advance` on the loop thread.
    pub fn on_expire(ctx: &mut ServerContext, fd: RawFd) {
        let Some(client) = ctx.connections.remove(&fd) else {
            log::error!("timer fired for untracked fd [{}]", fd);
            debug_assert!(false, "timer fired for untracked fd {}", fd);
            return;
        };
        log::debug!("connection fd [{}] idle, closing", fd);
        let reaped = Reaped {
            fd,
            peer: client.peer(),
            reason: ReapReason::IdleTimeout,
        };
        ctx.teardown(fd, client, reaped);
    }
}

mod reaped {
    use std::{fmt::Display, net::SocketAddr, os::fd::RawFd};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ReapReason {
        IdleTimeout,
        Closed,
    }

    impl Display for ReapReason {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::IdleTimeout => write!(f, "Connection idle timeout"),
                Self::Closed => write!(f, "Connection closed"),
            }
        }
    }

    /// Sent to subscribers once a connection has been torn down.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Reaped {
        pub fd: RawFd,
        pub peer: Option<SocketAddr>,
        pub reason: ReapReason,
    }
}
