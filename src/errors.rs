use std::{fmt::Display, os::fd::RawFd};

#[derive(Debug)]
pub enum IdleClockError {
    NonBlocking { fd: RawFd, source: std::io::Error },
    Registration { fd: RawFd, source: std::io::Error },
    SignalInstall { signal: i32, source: std::io::Error },
    UnknownConnection(RawFd),
    Io(std::io::Error),
}

impl Display for IdleClockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdleClockError::NonBlocking { fd, source } => {
                write!(f, "Could not set fd [{}] non-blocking : {}", fd, source)
            }
            IdleClockError::Registration { fd, source } => {
                write!(f, "Readiness registration failed for fd [{}] : {}", fd, source)
            }
            IdleClockError::SignalInstall { signal, source } => {
                write!(f, "Could not install handler for signal [{}] : {}", signal, source)
            }
            IdleClockError::UnknownConnection(fd) => {
                write!(f, "No connection tracked for fd [{}]", fd)
            }
            IdleClockError::Io(e) => {
                write!(f, "Io error [{:?}]", e.to_string())
            }
        }
    }
}

impl std::error::Error for IdleClockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IdleClockError::NonBlocking { source, .. }
            | IdleClockError::Registration { source, .. }
            | IdleClockError::SignalInstall { source, .. }
            | IdleClockError::Io(source) => Some(source),
            IdleClockError::UnknownConnection(_) => None,
        }
    }
}

impl From<std::io::Error> for IdleClockError {
    fn from(value: std::io::Error) -> Self {
        IdleClockError::Io(value)
    }
}
