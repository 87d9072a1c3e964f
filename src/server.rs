//! TCP server for line command connections.
//!
//! The accept loop polls the listener with a short timeout so it notices a
//! shutdown request promptly. Every accepted socket is handed to a freshly
//! spawned worker thread, and the loop only resumes accepting once that
//! worker has claimed it. Finished workers are reaped on every pass; at
//! shutdown the remaining ones are joined before the listener closes.

use crate::command::CommandTable;
use crate::runtime::handoff::{self, HandoffError};
use crate::runtime::{
    create_listener, ExitReason, Worker, WorkerHandle, WorkerRegistry, WorkerSettings,
};
use crate::shutdown::ShutdownFlag;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER: Token = Token(0);

/// Server instance
pub struct Server {
    listener: TcpListener,
    poll: Poll,
    settings: WorkerSettings,
    drain_timeout: Option<Duration>,
    table: Arc<CommandTable>,
    shutdown: ShutdownFlag,
    workers: WorkerRegistry,
    next_worker_id: u64,
}

impl Server {
    /// Bind the listening socket. Any failure here is fatal to startup.
    pub fn bind(
        addr: SocketAddr,
        backlog: i32,
        settings: WorkerSettings,
        table: CommandTable,
        shutdown: ShutdownFlag,
    ) -> io::Result<Self> {
        let mut listener = TcpListener::from_std(create_listener(addr, backlog)?);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        if table.is_empty() {
            warn!("Command table is empty, every token will be ignored");
        }
        info!(
            address = %listener.local_addr()?,
            commands = table.len(),
            "Server listening"
        );

        Ok(Server {
            listener,
            poll,
            settings,
            drain_timeout: None,
            table: Arc::new(table),
            shutdown,
            workers: WorkerRegistry::new(),
            next_worker_id: 0,
        })
    }

    /// Bound the final join on workers at shutdown.
    pub fn with_drain_timeout(mut self, limit: Option<Duration>) -> Self {
        self.drain_timeout = limit;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown is requested, then wait for the
    /// workers and close the listener.
    pub fn run(mut self) {
        let mut events = Events::with_capacity(16);

        while !self.shutdown.is_requested() {
            match self.poll.poll(&mut events, Some(self.settings.poll_timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Failed to poll listener");
                    continue;
                }
            }

            if !events.is_empty() {
                self.accept_pending();
            }

            let reaped = self.workers.reap();
            if reaped > 0 {
                debug!(reaped, active = self.workers.len(), "Reaped workers");
            }
        }

        info!(active = self.workers.len(), "Shutting down, waiting for workers");
        let detached = self.workers.drain(self.drain_timeout);
        if detached > 0 {
            warn!(detached, "Workers still running at exit");
        }
        info!("Server stopped");
    }

    /// Accept until the listener would block. Errors on a single accept are
    /// logged and never stop the loop.
    fn accept_pending(&mut self) {
        while !self.shutdown.is_requested() {
            match self.listener.accept() {
                Ok((stream, peer)) => self.spawn_worker(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    break;
                }
            }
        }
    }

    /// Spawn a worker and block until it owns `stream`.
    fn spawn_worker(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_worker_id;
        self.next_worker_id += 1;

        let (handoff, claim) = handoff::channel::<TcpStream>();
        let settings = self.settings;
        let table = Arc::clone(&self.table);
        let shutdown = self.shutdown.clone();

        let spawned = thread::Builder::new()
            .name(format!("conn-{id}"))
            .spawn(move || match claim.claim() {
                Some(stream) => Worker::new(id, stream, settings, table, shutdown).run(),
                None => ExitReason::Shutdown,
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                error!(peer = %peer, error = %e, "Failed to spawn worker, dropping connection");
                return;
            }
        };
        self.workers.insert(WorkerHandle::new(id, Some(peer), thread));

        match handoff.deliver(stream, self.settings.poll_timeout, &self.shutdown) {
            Ok(()) => info!(worker = id, peer = %peer, "Accepted connection"),
            Err(e) => {
                match e {
                    HandoffError::Abandoned(_) => {
                        debug!(worker = id, peer = %peer, "Shutdown before handoff, closing connection")
                    }
                    HandoffError::Disconnected(_) => {
                        warn!(worker = id, peer = %peer, "Worker exited before handoff")
                    }
                }
                drop(e.into_inner());
            }
        }
    }
}
