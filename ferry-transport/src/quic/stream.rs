use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use mio::Token;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, trace};

use ferry_wire::Buffer;

use super::Notifier;
use crate::{Error, IoOutcome};

const UNSET_TOKEN: usize = usize::MAX;
/// Largest chunk pulled off a receive stream at once.
const READ_CHUNK: usize = 64 * 1024;
/// Events a stream may queue for the event loop. With [`READ_CHUNK`] this caps unread data per
/// stream at 1 MiB; past that the reader waits and QUIC flow control pushes back on the peer.
pub(super) const EVENT_QUEUE: usize = 16;

/// What the background driver reports to the event loop.
#[derive(Debug)]
pub(super) enum QuicEvent {
    Connected,
    Data(Bytes),
    Eof,
    Failed(String),
}

/// What the event loop asks of the background driver.
#[derive(Debug)]
pub(super) enum Command {
    Send(Bytes),
    Finish,
}

/// State shared between a [`QuicStream`] and its driver.
#[derive(Debug)]
pub(super) struct Shared {
    token: AtomicUsize,
    in_flight: AtomicUsize,
    notifier: Arc<Notifier>,
}

impl Shared {
    pub(super) fn new(notifier: Arc<Notifier>, token: Option<Token>) -> Self {
        Self {
            token: AtomicUsize::new(token.map_or(UNSET_TOKEN, |t| t.0)),
            in_flight: AtomicUsize::new(0),
            notifier,
        }
    }

    /// Tells the event loop this stream has something for it.
    pub(super) fn notify(&self) {
        let token = self.token.load(Ordering::Acquire);
        if token != UNSET_TOKEN {
            self.notifier.notify(Token(token));
        }
    }
}

/// The driver's half of a [`QuicStream`].
pub(super) struct DriverHalf {
    pub(super) events: mpsc::Sender<QuicEvent>,
    pub(super) commands: mpsc::UnboundedReceiver<Command>,
    pub(super) shared: Arc<Shared>,
}

impl DriverHalf {
    pub(super) async fn emit(&self, event: QuicEvent) {
        if self.events.send(event).await.is_ok() {
            self.shared.notify();
        }
    }

    /// Pumps a bidirectional stream until both directions are done.
    pub(super) async fn run(
        mut self,
        connection: quinn::Connection,
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
    ) {
        let events = self.events.clone();
        let shared = Arc::clone(&self.shared);
        let reader = tokio::spawn(async move {
            loop {
                let event = match recv.read_chunk(READ_CHUNK, true).await {
                    Ok(Some(chunk)) => QuicEvent::Data(chunk.bytes),
                    Ok(None) => QuicEvent::Eof,
                    Err(e) => QuicEvent::Failed(e.to_string()),
                };
                let last = !matches!(event, QuicEvent::Data(_));
                if events.send(event).await.is_err() {
                    break;
                }
                shared.notify();
                if last {
                    break;
                }
            }
        });

        let mut finished = false;
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Send(bytes) => {
                    let len = bytes.len();
                    if let Err(e) = send.write_all(&bytes).await {
                        self.emit(QuicEvent::Failed(e.to_string())).await;
                        break;
                    }
                    self.shared.in_flight.fetch_sub(len, Ordering::AcqRel);
                    self.shared.notify();
                }
                Command::Finish => {
                    // Waits until the peer acknowledged everything we sent.
                    match send.finish().await {
                        Ok(()) => finished = true,
                        Err(e) => debug!(?e, "QUIC stream finish failed"),
                    }
                    break;
                }
            }
        }

        // Closing the connection discards whatever the peer still has to deliver, so a clean
        // finish waits for the receive side to end as well.
        if finished {
            if let Err(e) = reader.await {
                debug!(?e, "QUIC reader task ended abnormally");
            }
        } else {
            reader.abort();
        }
        connection.close(0u32.into(), b"done");
    }
}

/// A bidirectional QUIC stream driven by a background runtime, exposed through the same
/// non-blocking read/write surface as the socket transports.
pub struct QuicStream {
    peer: SocketAddr,
    shared: Arc<Shared>,
    events: mpsc::Receiver<QuicEvent>,
    commands: mpsc::UnboundedSender<Command>,
    /// Remainder of a received chunk that didn't fit the last read budget.
    pending: Option<Bytes>,
    connected: bool,
    eof: bool,
    /// A failure that arrived behind data we still had to deliver.
    failed: Option<String>,
    max_in_flight: usize,
}

impl fmt::Debug for QuicStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicStream")
            .field("peer", &self.peer)
            .field("connected", &self.connected)
            .field("eof", &self.eof)
            .field("in_flight", &self.shared.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

impl QuicStream {
    pub(super) fn new(
        peer: SocketAddr,
        notifier: Arc<Notifier>,
        token: Option<Token>,
        max_in_flight: usize,
    ) -> (Self, DriverHalf) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(notifier, token));

        let stream = Self {
            peer,
            shared: Arc::clone(&shared),
            events: events_rx,
            commands: commands_tx,
            pending: None,
            connected: false,
            eof: false,
            failed: None,
            max_in_flight,
        };
        (stream, DriverHalf { events: events_tx, commands: commands_rx, shared })
    }

    pub(super) fn mark_connected(&mut self) {
        self.connected = true;
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Sets the token the stream wakes the event loop with, and wakes it once so that anything
    /// that arrived before registration gets noticed.
    pub fn set_token(&self, token: Token) {
        self.shared.token.store(token.0, Ordering::Release);
        self.shared.notify();
    }

    /// Returns `true` once the stream is open, or an error if it failed to open.
    pub fn poll_connected(&mut self) -> Result<bool, Error> {
        if self.connected {
            return Ok(true);
        }

        match self.events.try_recv() {
            Ok(QuicEvent::Connected) => {
                self.connected = true;
                Ok(true)
            }
            Ok(QuicEvent::Failed(reason)) => Err(Error::QuicStream(reason)),
            Ok(other) => {
                // Data can't come first; treat it as an implicit open.
                debug!(?other, "QUIC event before open");
                self.connected = true;
                self.stash(other)?;
                Ok(true)
            }
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => Err(Error::ClosedEndpoint),
        }
    }

    fn stash(&mut self, event: QuicEvent) -> Result<(), Error> {
        match event {
            QuicEvent::Data(bytes) => self.pending = Some(bytes),
            QuicEvent::Eof => self.eof = true,
            QuicEvent::Failed(reason) => return Err(Error::QuicStream(reason)),
            QuicEvent::Connected => self.connected = true,
        }
        Ok(())
    }

    pub fn read_into(&mut self, buf: &mut Buffer, at_most: usize) -> Result<IoOutcome, Error> {
        if let Some(reason) = self.failed.take() {
            return Err(Error::QuicStream(reason));
        }

        let mut total = 0;

        while total < at_most {
            if let Some(mut bytes) = self.pending.take() {
                let n = bytes.len().min(at_most - total);
                buf.append(&bytes.split_to(n));
                total += n;
                if !bytes.is_empty() {
                    self.pending = Some(bytes);
                }
                continue;
            }

            if self.eof {
                break;
            }

            match self.events.try_recv() {
                Ok(QuicEvent::Failed(reason)) if total == 0 => {
                    return Err(Error::QuicStream(reason))
                }
                Ok(QuicEvent::Failed(reason)) => {
                    // Deliver what we have; the failure surfaces on the next read.
                    self.failed = Some(reason);
                    break;
                }
                Ok(event) => self.stash(event)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.eof = true,
            }
        }

        trace!(total, eof = self.eof, "QUIC read");
        if total > 0 {
            Ok(IoOutcome::Transferred(total))
        } else if self.eof {
            Ok(IoOutcome::Closed)
        } else {
            Ok(IoOutcome::WouldBlock)
        }
    }

    pub fn write_from(&mut self, buf: &mut Buffer, at_most: usize) -> Result<IoOutcome, Error> {
        let in_flight = self.shared.in_flight.load(Ordering::Acquire);
        let room = self.max_in_flight.saturating_sub(in_flight);
        if room == 0 {
            return Ok(IoOutcome::WouldBlock);
        }

        let mut total = 0;
        let limit = at_most.min(room);
        while total < limit && !buf.is_empty() {
            let chunk = buf.first_chunk();
            let n = chunk.len().min(limit - total);
            let bytes = Bytes::copy_from_slice(&chunk[..n]);

            self.shared.in_flight.fetch_add(n, Ordering::AcqRel);
            if self.commands.send(Command::Send(bytes)).is_err() {
                return Err(Error::QuicStream("stream driver is gone".to_string()));
            }
            buf.drain(n);
            total += n;
        }

        Ok(IoOutcome::Transferred(total))
    }

    /// Returns `true` while sent bytes are still queued for the network.
    pub fn has_pending_output(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire) > 0
    }

    /// Finishes the send side once queued data is out. The connection closes after that.
    pub fn shutdown(&mut self) {
        let _ = self.commands.send(Command::Finish);
    }
}

impl Drop for QuicStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}
