//! Per-connection runtime.
//!
//! One worker thread per accepted socket, each with its own readiness poll:
//! - `connection`: byte-at-a-time line state machine
//! - `handoff`: rendezvous that moves an accepted socket into its worker
//! - `registry`: the accept loop's list of running workers
//! - `worker`: the poll/read/dispatch loop for one socket

pub mod connection;
pub mod handoff;
pub mod registry;
pub mod worker;

pub(crate) use registry::{WorkerHandle, WorkerRegistry};
pub(crate) use worker::{ExitReason, Worker};

use crate::config::Config;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Knobs shared by the accept loop and every worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Longest single wait on any socket.
    pub poll_timeout: Duration,
    /// Bytes requested per receive call.
    pub read_buffer_size: usize,
}

impl From<&Config> for WorkerSettings {
    fn from(config: &Config) -> Self {
        Self {
            poll_timeout: config.poll_timeout,
            read_buffer_size: config.read_buffer_size,
        }
    }
}

/// Create a non-blocking listening socket with SO_REUSEADDR.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_on_ephemeral_port() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), 5).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(std::net::TcpStream::connect(addr).is_ok());
    }

    #[test]
    fn test_listener_port_in_use() {
        let first = create_listener("127.0.0.1:0".parse().unwrap(), 5).unwrap();
        let addr = first.local_addr().unwrap();
        assert!(create_listener(addr, 5).is_err());
    }
}
