//! Connection worker: one thread per accepted socket.
//!
//! Readiness-based model: the worker owns a private mio `Poll` with the
//! socket as its only source and never waits longer than the poll timeout,
//! so the shutdown flag is re-checked at that cadence even on an idle
//! connection.
//!
//! At most one receive happens per iteration. mio readiness is
//! edge-triggered, so `read_pending` remembers that the socket may still
//! hold data and the next iteration reads again without waiting on `poll`.
//! Reading pauses while queued output is above the outbound limit; the peer
//! is then throttled by the socket buffers alone.

use crate::command::CommandTable;
use crate::runtime::connection::{LineSession, LineState, GREETING};
use crate::runtime::WorkerSettings;
use crate::shutdown::ShutdownFlag;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONNECTION: Token = Token(0);

/// Queued output, in receive chunks, above which reading pauses.
const OUTBOUND_LIMIT_CHUNKS: usize = 2;

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The peer closed its side.
    PeerClosed,
    /// Shutdown was requested.
    Shutdown,
    /// Polling the socket failed.
    PollFailed,
    /// Receiving from the socket failed.
    ReadFailed,
    /// Sending to the socket failed.
    WriteFailed,
    /// The socket could not be registered with the poller.
    RegisterFailed,
}

/// Outcome of a single receive.
enum ReadOutcome {
    /// A chunk was consumed; more may be waiting.
    Data,
    /// The socket has nothing more for now.
    Drained,
    Closed,
}

pub struct Worker {
    id: u64,
    peer: Option<SocketAddr>,
    stream: TcpStream,
    settings: WorkerSettings,
    table: Arc<CommandTable>,
    shutdown: ShutdownFlag,
    session: LineSession,
    /// Bytes queued for the peer and not yet accepted by the socket.
    outbound: BytesMut,
    /// Whether WRITABLE interest is currently registered.
    write_interest: bool,
    /// Whether the socket may hold unread data.
    read_pending: bool,
}

impl Worker {
    pub fn new(
        id: u64,
        stream: TcpStream,
        settings: WorkerSettings,
        table: Arc<CommandTable>,
        shutdown: ShutdownFlag,
    ) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            id,
            peer,
            stream,
            settings,
            table,
            shutdown,
            session: LineSession::new(),
            outbound: BytesMut::with_capacity(settings.read_buffer_size * OUTBOUND_LIMIT_CHUNKS),
            write_interest: false,
            read_pending: false,
        }
    }

    /// Serve the connection until the peer leaves, an I/O error occurs, or
    /// shutdown is requested. The socket is closed when `self` drops.
    pub fn run(mut self) -> ExitReason {
        let reason = self.serve();
        match reason {
            ExitReason::PeerClosed => {
                info!(worker = self.id, peer = ?self.peer, "Connection closed by client")
            }
            ExitReason::Shutdown if self.session.state() == LineState::Accumulating => {
                info!(
                    worker = self.id,
                    peer = ?self.peer,
                    discarded = self.session.pending_line().len(),
                    "Connection closed for shutdown mid-line"
                )
            }
            ExitReason::Shutdown => {
                info!(worker = self.id, peer = ?self.peer, "Connection closed for shutdown")
            }
            _ => warn!(worker = self.id, peer = ?self.peer, ?reason, "Connection terminated"),
        }
        reason
    }

    fn serve(&mut self) -> ExitReason {
        let mut poll = match self.start() {
            Ok(poll) => poll,
            Err(reason) => return reason,
        };

        let mut events = Events::with_capacity(4);
        let mut buf = vec![0u8; self.settings.read_buffer_size];

        while !self.shutdown.is_requested() {
            if let Some(reason) = self.step(&mut poll, &mut events, &mut buf) {
                return reason;
            }
        }

        ExitReason::Shutdown
    }

    /// Register the socket and send the greeting.
    fn start(&mut self) -> Result<Poll, ExitReason> {
        let poll = Poll::new().map_err(|e| {
            warn!(worker = self.id, error = %e, "Failed to create poller");
            ExitReason::RegisterFailed
        })?;
        poll.registry()
            .register(&mut self.stream, CONNECTION, Interest::READABLE)
            .map_err(|e| {
                warn!(worker = self.id, error = %e, "Failed to register connection");
                ExitReason::RegisterFailed
            })?;

        self.outbound.extend_from_slice(GREETING);
        self.flush(&poll).map_err(|e| {
            debug!(worker = self.id, error = %e, "Failed to send greeting");
            ExitReason::WriteFailed
        })?;
        Ok(poll)
    }

    /// One poll/receive/send iteration. Returns the exit reason when the
    /// connection is finished.
    fn step(
        &mut self,
        poll: &mut Poll,
        events: &mut Events,
        buf: &mut [u8],
    ) -> Option<ExitReason> {
        // Known unread data means there is no reason to wait.
        let timeout = if self.can_read() {
            Duration::ZERO
        } else {
            self.settings.poll_timeout
        };

        match poll.poll(events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return None,
            Err(e) => {
                warn!(worker = self.id, error = %e, "Failed to poll connection");
                return Some(ExitReason::PollFailed);
            }
        }

        if events
            .iter()
            .any(|event| event.is_readable() || event.is_read_closed())
        {
            self.read_pending = true;
        }

        if self.can_read() {
            match self.read_chunk(buf) {
                Ok(ReadOutcome::Data) => {}
                Ok(ReadOutcome::Drained) => self.read_pending = false,
                Ok(ReadOutcome::Closed) => {
                    // Replies already produced still go out before the close.
                    let _ = self.flush(poll);
                    return Some(ExitReason::PeerClosed);
                }
                Err(e) => {
                    debug!(worker = self.id, error = %e, "Failed to receive data");
                    return Some(ExitReason::ReadFailed);
                }
            }
        }

        if let Err(e) = self.flush(poll) {
            debug!(worker = self.id, error = %e, "Failed to send data");
            return Some(ExitReason::WriteFailed);
        }
        None
    }

    fn outbound_limit(&self) -> usize {
        self.settings.read_buffer_size * OUTBOUND_LIMIT_CHUNKS
    }

    fn can_read(&self) -> bool {
        self.read_pending && self.outbound.len() < self.outbound_limit()
    }

    /// Receive one chunk and feed it through the line session.
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => {
                    self.session
                        .feed_all(&buf[..n], &self.table, &self.shutdown, &mut self.outbound);
                    return Ok(ReadOutcome::Data);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Drained)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much queued output as the socket accepts. Leftovers keep
    /// WRITABLE interest registered until they drain.
    fn flush(&mut self, poll: &Poll) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let want_write = !self.outbound.is_empty();
        if want_write != self.write_interest {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            poll.registry()
                .reregister(&mut self.stream, CONNECTION, interest)?;
            self.write_interest = want_write;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Shutdown, TcpListener};
    use std::thread;
    use std::time::Instant;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            poll_timeout: Duration::from_micros(100),
            read_buffer_size: 256,
        }
    }

    /// Build a worker on one end of a loopback connection and return the
    /// client end with it.
    fn connected_worker(shutdown: &ShutdownFlag) -> (std::net::TcpStream, Worker) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();

        let worker = Worker::new(
            0,
            TcpStream::from_std(server_side),
            settings(),
            Arc::new(CommandTable::with_builtins()),
            shutdown.clone(),
        );
        (client, worker)
    }

    fn spawn_worker(
        shutdown: &ShutdownFlag,
    ) -> (std::net::TcpStream, thread::JoinHandle<ExitReason>) {
        let (client, worker) = connected_worker(shutdown);
        (client, thread::spawn(move || worker.run()))
    }

    fn expect(client: &mut std::net::TcpStream, expected: &[u8]) {
        let mut got = vec![0u8; expected.len()];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, expected, "got {:?}", String::from_utf8_lossy(&got));
    }

    #[test]
    fn test_session_until_peer_closes() {
        let shutdown = ShutdownFlag::new();
        let (mut client, worker) = spawn_worker(&shutdown);

        expect(&mut client, b">>");
        client.write_all(b"Dir\r").unwrap();
        expect(&mut client, b"Dir\r\nDirectory...\n\r\n>>");

        client.shutdown(Shutdown::Write).unwrap();
        assert_eq!(worker.join().unwrap(), ExitReason::PeerClosed);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_idle_connection_observes_shutdown() {
        let shutdown = ShutdownFlag::new();
        let (mut client, worker) = spawn_worker(&shutdown);

        expect(&mut client, b">>");
        thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_finished());

        shutdown.request();
        assert_eq!(worker.join().unwrap(), ExitReason::Shutdown);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_partial_line_discarded_on_shutdown() {
        let shutdown = ShutdownFlag::new();
        let (mut client, worker) = spawn_worker(&shutdown);

        expect(&mut client, b">>");
        client.write_all(b"di").unwrap();
        expect(&mut client, b"di");

        shutdown.request();
        assert_eq!(worker.join().unwrap(), ExitReason::Shutdown);
    }

    #[test]
    fn test_ex_stops_worker() {
        let shutdown = ShutdownFlag::new();
        let (mut client, worker) = spawn_worker(&shutdown);

        expect(&mut client, b">>");
        client.write_all(b"ex\n").unwrap();
        expect(&mut client, b"ex\r\n>>");

        assert_eq!(worker.join().unwrap(), ExitReason::Shutdown);
        assert!(shutdown.is_requested());
    }

    #[test]
    fn test_flooding_peer_observes_shutdown() {
        let shutdown = ShutdownFlag::new();
        let (mut client, worker) = spawn_worker(&shutdown);

        let mut writer = client.try_clone().unwrap();
        writer
            .set_write_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let flood = thread::spawn(move || {
            let chunk = vec![b'a'; 64 * 1024];
            while writer.write_all(&chunk).is_ok() {}
        });
        let drain = thread::spawn(move || {
            let mut sink = [0u8; 64 * 1024];
            while matches!(client.read(&mut sink), Ok(n) if n > 0) {}
        });

        thread::sleep(Duration::from_millis(200));
        assert!(!worker.is_finished());

        shutdown.request();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(worker.is_finished(), "worker ignored shutdown under load");
        assert_eq!(worker.join().unwrap(), ExitReason::Shutdown);

        flood.join().unwrap();
        drain.join().unwrap();
    }

    #[test]
    fn test_non_reading_peer_is_throttled() {
        const TOTAL: usize = 64 * 1024 * 1024;

        let shutdown = ShutdownFlag::new();
        let (client, mut worker) = connected_worker(&shutdown);

        let mut writer = client.try_clone().unwrap();
        writer
            .set_write_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let flood = thread::spawn(move || {
            let chunk = vec![b'a'; 64 * 1024];
            let mut written = 0;
            while written < TOTAL {
                match writer.write(&chunk) {
                    Ok(n) => written += n,
                    Err(_) => break,
                }
            }
            written
        });

        let mut poll = worker.start().unwrap();
        let mut events = Events::with_capacity(4);
        let mut buf = vec![0u8; worker.settings.read_buffer_size];
        // One chunk of printable input echoes back byte for byte.
        let bound = worker.outbound_limit() + worker.settings.read_buffer_size;

        let deadline = Instant::now() + Duration::from_secs(20);
        while !flood.is_finished() && Instant::now() < deadline {
            assert_eq!(worker.step(&mut poll, &mut events, &mut buf), None);
            assert!(
                worker.outbound.len() <= bound,
                "outbound grew to {}",
                worker.outbound.len()
            );
        }

        let written = flood.join().unwrap();
        assert!(written < TOTAL, "peer was never throttled");
        assert!(worker.session.pending_line().len() < TOTAL);
        drop(client);
    }
}
