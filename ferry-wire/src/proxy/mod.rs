//! Client side of the outbound proxy handshakes: SOCKS4, SOCKS5 (with optional RFC 1929
//! username/password authentication) and HTTP CONNECT.
//!
//! [`ProxyHandshake`] is a small state machine that writes requests into an output
//! [`Buffer`] and parses replies from an input [`Buffer`]. It never touches a socket; the
//! caller moves bytes between the buffers and the transport.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::buf::Buffer;

mod http;
mod socks;

pub use http::MAX_HEADERS_SIZE;
pub use socks::{socks5_reply_reason, MAX_SOCKS5_AUTH_FIELD_SIZE, MAX_SOCKS5_AUTH_SIZE_TOTAL};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyError {
    /// The proxy understood us and refused.
    #[error("Proxy rejected the request: {0}")]
    Rejected(String),
    /// We could not make sense of what the proxy sent.
    #[error("Rejected proxy reply: {0}")]
    Malformed(String),
    #[error("Cannot build proxy request: {0}")]
    InvalidRequest(String),
    #[error("Proxy handshake is not expecting input in state {0:?}")]
    UnexpectedState(ProxyState),
}

/// The proxy protocol spoken to the first hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocol {
    HttpConnect,
    Socks4,
    Socks5,
}

/// The host part of the address the proxy is asked to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHost {
    Ip(IpAddr),
    Domain(String),
}

/// The address the proxy is asked to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: TargetHost,
    pub port: u16,
}

impl ProxyTarget {
    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Self { host: TargetHost::Domain(name.into()), port }
    }
}

impl From<SocketAddr> for ProxyTarget {
    fn from(addr: SocketAddr) -> Self {
        Self { host: TargetHost::Ip(addr.ip()), port: addr.port() }
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            TargetHost::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            TargetHost::Ip(IpAddr::V4(ip)) => write!(f, "{ip}:{}", self.port),
            TargetHost::Domain(name) => write!(f, "{name}:{}", self.port),
        }
    }
}

/// Username and password presented to the proxy.
///
/// SOCKS4 only uses the username (as the user id). HTTP CONNECT sends both as a
/// `Proxy-Authorization: Basic` header.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &String::from_utf8_lossy(&self.username))
            .field("password", &"<redacted>")
            .finish()
    }
}

impl ProxyCredentials {
    pub fn new(username: impl Into<Vec<u8>>, password: impl Into<Vec<u8>>) -> Self {
        Self { username: username.into(), password: password.into() }
    }

    /// Packs a pluggable-transport argument string into the SOCKS5 username/password fields.
    ///
    /// Arguments that fit in one field go into the username with a single NUL byte as the
    /// password. Longer arguments spill into the password field.
    pub fn from_transport_args(args: &[u8]) -> Result<Self, ProxyError> {
        if args.len() > MAX_SOCKS5_AUTH_SIZE_TOTAL {
            return Err(ProxyError::InvalidRequest(format!(
                "transport arguments are {} bytes, at most {MAX_SOCKS5_AUTH_SIZE_TOTAL} fit",
                args.len()
            )));
        }

        if args.len() > MAX_SOCKS5_AUTH_FIELD_SIZE {
            let (user, pass) = args.split_at(MAX_SOCKS5_AUTH_FIELD_SIZE);
            Ok(Self::new(user, pass))
        } else {
            Ok(Self::new(args, &b"\0"[..]))
        }
    }
}

/// Everything needed to drive a handshake with the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub protocol: ProxyProtocol,
    pub target: ProxyTarget,
    pub credentials: Option<ProxyCredentials>,
}

impl ProxyRequest {
    pub fn new(protocol: ProxyProtocol, target: impl Into<ProxyTarget>) -> Self {
        Self { protocol, target: target.into(), credentials: None }
    }

    pub fn with_credentials(mut self, credentials: ProxyCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Where the handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Nothing has been sent yet.
    Infant,
    HttpConnectWaitingOk,
    Socks4WaitingOk,
    /// Greeting sent offering only "no authentication".
    Socks5WaitingAuthMethodNone,
    /// Greeting sent offering "no authentication" and username/password.
    Socks5WaitingAuthMethodUserPass,
    Socks5WaitingAuthResult,
    Socks5WaitingConnectOk,
    Connected,
}

/// The outcome of feeding a reply parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// The reply is incomplete; nothing was consumed.
    NeedMore,
    /// The reply was accepted and consumed.
    Ok,
    /// The SOCKS5 proxy picked username/password authentication.
    AuthRequired,
}

/// Reported by [`ProxyHandshake::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    /// Waiting for more bytes from the proxy.
    Pending,
    /// The tunnel is up. Any bytes left in the input buffer belong to the tunneled stream.
    Connected,
}

/// Drives one proxy handshake.
#[derive(Debug, Clone)]
pub struct ProxyHandshake {
    request: ProxyRequest,
    state: ProxyState,
}

impl ProxyHandshake {
    pub fn new(request: ProxyRequest) -> Self {
        Self { request, state: ProxyState::Infant }
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    pub fn request(&self) -> &ProxyRequest {
        &self.request
    }

    pub fn is_connected(&self) -> bool {
        self.state == ProxyState::Connected
    }

    /// Queues the first protocol message. Call this once the transport to the proxy is up.
    pub fn start(&mut self, outbuf: &mut Buffer) -> Result<(), ProxyError> {
        if self.state != ProxyState::Infant {
            return Err(ProxyError::UnexpectedState(self.state));
        }

        let request = &self.request;
        self.state = match request.protocol {
            ProxyProtocol::HttpConnect => {
                http::write_connect_request(outbuf, &request.target, request.credentials.as_ref());
                ProxyState::HttpConnectWaitingOk
            }
            ProxyProtocol::Socks4 => {
                let userid = request.credentials.as_ref().map_or(&[][..], |c| &c.username[..]);
                socks::write_socks4_request(outbuf, &request.target, userid)?;
                ProxyState::Socks4WaitingOk
            }
            ProxyProtocol::Socks5 => {
                let offer_auth = request.credentials.is_some();
                socks::write_socks5_greeting(outbuf, offer_auth);
                if offer_auth {
                    ProxyState::Socks5WaitingAuthMethodUserPass
                } else {
                    ProxyState::Socks5WaitingAuthMethodNone
                }
            }
        };

        debug!(protocol = ?request.protocol, target = %request.target, state = ?self.state, "Started proxy handshake");
        Ok(())
    }

    /// Parses whatever the proxy has sent so far, queueing follow-up requests into `outbuf`.
    ///
    /// Any error is terminal for the handshake.
    pub fn advance(
        &mut self,
        inbuf: &mut Buffer,
        outbuf: &mut Buffer,
    ) -> Result<ProxyStatus, ProxyError> {
        loop {
            let step = match self.state {
                ProxyState::Infant => return Err(ProxyError::UnexpectedState(self.state)),
                ProxyState::Connected => return Ok(ProxyStatus::Connected),
                ProxyState::HttpConnectWaitingOk => http::parse_connect_response(inbuf)?,
                ProxyState::Socks4WaitingOk => socks::parse_socks4_reply(inbuf)?,
                ProxyState::Socks5WaitingAuthMethodNone => socks::parse_method_reply(inbuf, false)?,
                ProxyState::Socks5WaitingAuthMethodUserPass => {
                    socks::parse_method_reply(inbuf, true)?
                }
                ProxyState::Socks5WaitingAuthResult => socks::parse_auth_reply(inbuf)?,
                ProxyState::Socks5WaitingConnectOk => socks::parse_connect_reply(inbuf)?,
            };

            let next = match (self.state, step) {
                (_, Step::NeedMore) => return Ok(ProxyStatus::Pending),
                (ProxyState::Socks5WaitingAuthMethodUserPass, Step::AuthRequired) => {
                    let Some(credentials) = self.request.credentials.as_ref() else {
                        return Err(ProxyError::Malformed(
                            "proxy asked for credentials we do not have".to_string(),
                        ));
                    };
                    socks::write_userpass_auth(outbuf, credentials)?;
                    ProxyState::Socks5WaitingAuthResult
                }
                (ProxyState::Socks5WaitingAuthMethodNone, Step::Ok) |
                (ProxyState::Socks5WaitingAuthMethodUserPass, Step::Ok) |
                (ProxyState::Socks5WaitingAuthResult, Step::Ok) => {
                    socks::write_socks5_connect(outbuf, &self.request.target)?;
                    ProxyState::Socks5WaitingConnectOk
                }
                (_, Step::Ok) => ProxyState::Connected,
                (state, Step::AuthRequired) => return Err(ProxyError::UnexpectedState(state)),
            };

            trace!(from = ?self.state, to = ?next, "Proxy handshake advanced");
            self.state = next;
        }
    }
}
