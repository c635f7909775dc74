//! The alternate datagram transport: QUIC streams from `quinn`.
//!
//! `quinn` is async, while the rest of the stack runs one readiness loop. The bridge is a
//! small background tokio runtime. Every stream and listener owns channel ends to it, and the
//! runtime wakes the readiness loop through a [`mio::Waker`], leaving the token of whatever
//! became ready in a shared queue.

use std::{fmt, net::SocketAddr, sync::Arc};

use mio::{Token, Waker};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, error};

use crate::Error;

mod config;
mod stream;

pub use config::QuicConfig;
pub use stream::QuicStream;
use stream::{QuicEvent, Shared};

/// Wakes the readiness loop on behalf of QUIC streams and listeners.
pub struct Notifier {
    waker: Waker,
    ready: Mutex<Vec<Token>>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").field("ready", &self.ready.lock().len()).finish()
    }
}

impl Notifier {
    pub fn new(waker: Waker) -> Self {
        Self { waker, ready: Mutex::new(Vec::new()) }
    }

    pub(crate) fn notify(&self, token: Token) {
        self.ready.lock().push(token);
        if let Err(e) = self.waker.wake() {
            error!(?e, "Failed to wake the event loop");
        }
    }

    /// Takes the tokens that became ready since the last call, without duplicates.
    pub fn take_ready(&self) -> Vec<Token> {
        let mut ready = std::mem::take(&mut *self.ready.lock());
        ready.sort_unstable();
        ready.dedup();
        ready
    }
}

/// Owns the background runtime and the client endpoint used for outbound QUIC streams.
pub struct QuicContext {
    runtime: tokio::runtime::Runtime,
    notifier: Arc<Notifier>,
    config: QuicConfig,
    client_endpoint: Option<quinn::Endpoint>,
}

impl fmt::Debug for QuicContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicContext")
            .field("client_endpoint", &self.client_endpoint.as_ref().and_then(|e| e.local_addr().ok()))
            .finish()
    }
}

impl QuicContext {
    pub fn new(waker: Waker, config: QuicConfig) -> Result<Self, Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ferry-quic")
            .enable_all()
            .build()?;

        Ok(Self { runtime, notifier: Arc::new(Notifier::new(waker)), config, client_endpoint: None })
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Returns `true` once the shared client endpoint (and its UDP socket) exists.
    pub fn has_client_endpoint(&self) -> bool {
        self.client_endpoint.is_some()
    }

    fn client_endpoint(&mut self) -> Result<quinn::Endpoint, Error> {
        if let Some(endpoint) = &self.client_endpoint {
            return Ok(endpoint.clone());
        }

        let _guard = self.runtime.enter();
        let endpoint = quinn::Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        self.client_endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }

    /// Starts connecting to `addr`. The stream reports completion through
    /// [`QuicStream::poll_connected`] after waking `token`.
    pub fn connect(&mut self, addr: SocketAddr, token: Token) -> Result<QuicStream, Error> {
        let endpoint = self.client_endpoint()?;
        // An empty string is an invalid server name, and we don't use names anyway.
        let connecting = endpoint.connect_with(self.config.client_config.clone(), addr, "l")?;

        let (stream, driver) =
            QuicStream::new(addr, Arc::clone(&self.notifier), Some(token), self.config.max_in_flight);

        self.runtime.spawn(async move {
            let connection = match connecting.await {
                Ok(connection) => connection,
                Err(e) => {
                    driver.emit(QuicEvent::Failed(e.to_string())).await;
                    return;
                }
            };
            match connection.open_bi().await {
                Ok((send, recv)) => {
                    driver.emit(QuicEvent::Connected).await;
                    driver.run(connection, send, recv).await;
                }
                Err(e) => driver.emit(QuicEvent::Failed(e.to_string())).await,
            }
        });

        Ok(stream)
    }

    /// Binds a server endpoint on `addr`. Accepted streams are announced by waking `token`.
    pub fn listen(&mut self, addr: SocketAddr, token: Token) -> Result<QuicListener, Error> {
        let endpoint = {
            let _guard = self.runtime.enter();
            quinn::Endpoint::server(self.config.server_config.clone(), addr)?
        };
        let local_addr = endpoint.local_addr()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(Arc::clone(&self.notifier), Some(token)));
        let notifier = Arc::clone(&self.notifier);
        let max_in_flight = self.config.max_in_flight;

        let accept_endpoint = endpoint.clone();
        self.runtime.spawn(async move {
            while let Some(connecting) = accept_endpoint.accept().await {
                let tx = tx.clone();
                let shared = Arc::clone(&shared);
                let notifier = Arc::clone(&notifier);

                tokio::spawn(async move {
                    let connection = match connecting.await {
                        Ok(connection) => connection,
                        Err(e) => {
                            debug!(?e, "Incoming QUIC connection failed");
                            return;
                        }
                    };

                    let peer = connection.remote_address();
                    let (mut stream, driver) = QuicStream::new(peer, notifier, None, max_in_flight);
                    stream.mark_connected();
                    if tx.send(stream).is_err() {
                        return;
                    }
                    shared.notify();

                    // The client's stream only shows up once it sends something.
                    match connection.accept_bi().await {
                        Ok((send, recv)) => driver.run(connection, send, recv).await,
                        Err(e) => driver.emit(QuicEvent::Failed(e.to_string())).await,
                    }
                });
            }
            debug!("QUIC endpoint stopped accepting");
        });

        Ok(QuicListener { endpoint, local_addr, incoming: rx })
    }
}

/// A bound QUIC endpoint handing out accepted streams.
pub struct QuicListener {
    endpoint: quinn::Endpoint,
    local_addr: SocketAddr,
    incoming: mpsc::UnboundedReceiver<QuicStream>,
}

impl fmt::Debug for QuicListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuicListener").field("local_addr", &self.local_addr).finish()
    }
}

impl QuicListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the next accepted stream, or `None` if there is none yet. Accepted streams are
    /// open already; call [`QuicStream::set_token`] before relying on wake-ups.
    pub fn accept(&mut self) -> Result<Option<QuicStream>, Error> {
        match self.incoming.try_recv() {
            Ok(stream) => Ok(Some(stream)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::ClosedEndpoint),
        }
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.endpoint.close(0u32.into(), b"listener closed");
    }
}
