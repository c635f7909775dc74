//! TLS over a non-blocking TCP socket, driven by `rustls`' sans-IO connection state.

use std::{
    fmt,
    io::{self, Read, Write},
    sync::Arc,
};

use mio::net::TcpStream;
use rustls::{ClientConnection, Connection, ServerConnection};
use tracing::{debug, trace};

use ferry_wire::Buffer;

use crate::{Error, IoOutcome};

mod config;
pub use config::{self_signed_certificate, unsafe_client_config, TlsOptions};

/// A TLS session layered on a TCP socket.
pub struct TlsStream {
    session: Connection,
    sock: TcpStream,
    /// The socket returned EOF.
    sock_eof: bool,
}

impl fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsStream")
            .field("peer", &self.sock.peer_addr().ok())
            .field("handshaking", &self.session.is_handshaking())
            .field("sock_eof", &self.sock_eof)
            .finish()
    }
}

impl TlsStream {
    /// Starts the client side of a handshake on a connected socket.
    pub fn client(sock: TcpStream, options: &TlsOptions) -> Result<Self, Error> {
        let session = ClientConnection::new(Arc::clone(&options.client), options.server_name()?)?;
        Ok(Self { session: session.into(), sock, sock_eof: false })
    }

    /// Starts the server side of a handshake on an accepted socket.
    pub fn server(sock: TcpStream, config: Arc<rustls::ServerConfig>) -> Result<Self, Error> {
        let session = ServerConnection::new(config)?;
        Ok(Self { session: session.into(), sock, sock_eof: false })
    }

    pub fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }

    /// Returns `true` if encrypted records are waiting to be written to the socket.
    pub fn has_pending_output(&self) -> bool {
        self.session.wants_write()
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.sock
    }

    pub fn get_mut(&mut self) -> &mut TcpStream {
        &mut self.sock
    }

    /// Reads up to `at_most` plaintext bytes into `buf`.
    ///
    /// Plaintext already decrypted inside the session is drained before (and after) pulling
    /// more records off the socket, so nothing is left behind that a readiness event would
    /// never announce.
    pub fn read_into(&mut self, buf: &mut Buffer, at_most: usize) -> Result<IoOutcome, Error> {
        let mut total = 0;
        let mut closed = false;

        loop {
            // Drain plaintext first.
            while total < at_most {
                let want = at_most - total;
                let spare = buf.reserve_tail(want);
                let len = spare.len().min(want);

                match self.session.reader().read(&mut spare[..len]) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => {
                        buf.commit_tail(n);
                        total += n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    // The socket closed without a close_notify alert.
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        debug!("TLS peer closed the socket without close_notify");
                        closed = true;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if total >= at_most || closed || self.sock_eof {
                break;
            }

            match self.session.read_tls(&mut self.sock) {
                Ok(0) => {
                    self.sock_eof = true;
                    self.process_packets()?;
                }
                Ok(n) => {
                    trace!(n, "Read TLS records");
                    self.process_packets()?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        // The handshake may have queued records of its own.
        let flushed = self.flush_records()?;

        if total > 0 {
            Ok(IoOutcome::Transferred(total))
        } else if closed || (self.sock_eof && !self.session.is_handshaking()) {
            Ok(IoOutcome::Closed)
        } else if self.sock_eof {
            Err(io::Error::from(io::ErrorKind::UnexpectedEof).into())
        } else if !flushed {
            Ok(IoOutcome::WantWrite)
        } else {
            Ok(IoOutcome::WouldBlock)
        }
    }

    /// Encrypts up to `at_most` bytes from the head of `buf` and writes the records out.
    ///
    /// Bytes accepted by the session count as written even when the socket blocks; they stay
    /// queued as records until the next call. See [`TlsStream::has_pending_output`].
    pub fn write_from(&mut self, buf: &mut Buffer, at_most: usize) -> Result<IoOutcome, Error> {
        // Don't let queued records pile up behind a blocked socket.
        if !self.flush_records()? {
            return Ok(if self.session.is_handshaking() && self.session.wants_read() {
                IoOutcome::WantRead
            } else {
                IoOutcome::WouldBlock
            });
        }

        let mut total = 0;
        while total < at_most && !buf.is_empty() {
            let chunk = buf.first_chunk();
            let len = chunk.len().min(at_most - total);

            let n = self.session.writer().write(&chunk[..len])?;
            if n == 0 {
                break;
            }
            buf.drain(n);
            total += n;

            if !self.flush_records()? {
                break;
            }
        }

        if total == 0 && self.session.is_handshaking() && !self.session.wants_write() {
            // Our plaintext waits on the peer's half of the handshake.
            return Ok(IoOutcome::WantRead);
        }

        Ok(IoOutcome::Transferred(total))
    }

    /// Sends close_notify and makes a best effort to get it onto the wire.
    pub fn shutdown(&mut self) {
        self.session.send_close_notify();
        let _ = self.flush_records();
        let _ = self.sock.shutdown(std::net::Shutdown::Write);
    }

    fn process_packets(&mut self) -> Result<(), Error> {
        match self.session.process_new_packets() {
            Ok(_) => Ok(()),
            Err(e) => {
                // Try to tell the peer why.
                let _ = self.session.write_tls(&mut self.sock);
                Err(e.into())
            }
        }
    }

    /// Writes queued records until the session is drained or the socket blocks.
    /// Returns `true` if nothing is left queued.
    fn flush_records(&mut self) -> Result<bool, Error> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.sock) {
                Ok(0) => return Ok(false),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}
