use std::{
    io::{self, Read, Write},
    net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    thread::{self, JoinHandle},
};

use ferry_net::{
    CloseReason, ConnectOptions, CoreOptions, ListenerConfig, ListenerRole, ProxyConfig,
    RelayState, Role, RoleKind, TransportKind,
};
use ferry_transport::{tls::TlsOptions, StreamKind};
use ferry_wire::proxy::{ProxyCredentials, ProxyProtocol};

use crate::common::{listen, localhost, runtime, Mirror, Recorder, WAIT};

/// A one-shot SOCKS5 proxy. It answers the greeting with `method`, checks the credentials if
/// it asked for them, answers the connect request with `reply`, and then echoes. Returns the
/// connect request it received.
fn socks5_proxy(method: u8, reply: u8) -> (SocketAddr, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();

        let mut greeting = [0u8; 2];
        sock.read_exact(&mut greeting).unwrap();
        assert_eq!(greeting[0], 5);
        let mut methods = vec![0u8; greeting[1] as usize];
        sock.read_exact(&mut methods).unwrap();
        assert!(methods.contains(&method));
        sock.write_all(&[5, method]).unwrap();

        if method == 2 {
            let mut head = [0u8; 2];
            sock.read_exact(&mut head).unwrap();
            let mut user = vec![0u8; head[1] as usize];
            sock.read_exact(&mut user).unwrap();
            let mut len = [0u8; 1];
            sock.read_exact(&mut len).unwrap();
            let mut pass = vec![0u8; len[0] as usize];
            sock.read_exact(&mut pass).unwrap();
            assert_eq!((user.as_slice(), pass.as_slice()), (&b"alice"[..], &b"hunter2"[..]));
            sock.write_all(&[1, 0]).unwrap();
        }

        // IPv4 targets only: version, command, reserved, type, 4 address bytes, port.
        let mut request = vec![0u8; 10];
        sock.read_exact(&mut request).unwrap();
        sock.write_all(&[5, reply, 0, 1, 0, 0, 0, 0, 0, 0]).unwrap();
        if reply != 0 {
            return request;
        }

        let mut buf = [0u8; 1024];
        loop {
            match sock.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => sock.write_all(&buf[..n]).unwrap(),
            }
        }
        request
    });

    (addr, handle)
}

/// A one-shot SOCKS5 proxy without authentication that really connects to the requested
/// IPv4 target and splices the two sockets together.
fn socks5_forwarder() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        let (mut client, _) = listener.accept().unwrap();

        let mut greeting = [0u8; 3];
        client.read_exact(&mut greeting).unwrap();
        client.write_all(&[5, 0]).unwrap();

        let mut request = [0u8; 10];
        client.read_exact(&mut request).unwrap();
        let ip = Ipv4Addr::new(request[4], request[5], request[6], request[7]);
        let port = u16::from_be_bytes([request[8], request[9]]);
        let target = TcpStream::connect((ip, port)).unwrap();
        client.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).unwrap();

        let splice = |mut from: TcpStream, mut to: TcpStream| {
            let _ = io::copy(&mut from, &mut to);
            let _ = to.shutdown(Shutdown::Write);
        };
        let (c, t) = (client.try_clone().unwrap(), target.try_clone().unwrap());
        let upstream = thread::spawn(move || splice(c, t));
        splice(target, client);
        upstream.join().unwrap();
    });

    addr
}

#[test]
fn tls_relay_link_through_a_proxy() {
    let mirror = Mirror::default();
    let tls = TlsOptions::self_signed().unwrap();
    let mut rt = runtime(CoreOptions::default().with_tls(tls))
        .with_processor(RoleKind::Relay, mirror.clone());

    let (_, target) =
        listen(&mut rt, ListenerConfig::tcp(localhost(), ListenerRole::Relay).with_tls());
    let proxy = ProxyConfig::new(ProxyProtocol::Socks5, socks5_forwarder());
    let opts = ConnectOptions::default().through_proxy(proxy).with_tls();
    let id = rt.core_mut().connect(RoleKind::Relay, target, opts).unwrap();

    // Proxy tunnel first, then the TLS handshake inside it.
    let seen = &mirror.0;
    assert!(rt.run_until(WAIT, |_| seen.seen().connected.contains(&id)).unwrap());
    let conn = rt.core().connection(id).unwrap();
    assert_eq!(conn.role(), &Role::Relay(RelayState::Open));
    assert_eq!(conn.kind(), TransportKind::Stream(StreamKind::Tls));

    rt.core_mut().append_bytes(id, b"tunnelled and sealed").unwrap();
    assert!(rt.run_until(WAIT, |_| seen.seen().received.len() == 20).unwrap());
    assert_eq!(seen.seen().received, b"tunnelled and sealed");
    assert!(seen.seen().closed.is_empty());
}

#[test]
fn relay_link_through_socks5_with_auth() {
    let (proxy_addr, proxy) = socks5_proxy(2, 0);
    let recorder = Recorder::default();
    let mut rt = runtime(CoreOptions::default()).with_processor(RoleKind::Relay, recorder.clone());

    let target: SocketAddr = "10.1.2.3:9001".parse().unwrap();
    let proxy_config = ProxyConfig::new(ProxyProtocol::Socks5, proxy_addr)
        .with_credentials(ProxyCredentials::new("alice", "hunter2"));
    let id = rt
        .core_mut()
        .connect(RoleKind::Relay, target.into(), ConnectOptions::default().through_proxy(proxy_config))
        .unwrap();

    assert!(rt.run_until(WAIT, |_| recorder.seen().connected.contains(&id)).unwrap());
    assert_eq!(rt.core().connection(id).unwrap().role(), &Role::Relay(RelayState::Open));
    assert_eq!(rt.core().connection(id).unwrap().address(), Some(&target.into()));

    rt.core_mut().append_bytes(id, b"through the tunnel").unwrap();
    assert!(rt.run_until(WAIT, |_| recorder.seen().received.len() == 18).unwrap());
    assert_eq!(recorder.seen().received, b"through the tunnel");

    rt.core_mut().mark_for_close(id).unwrap();
    assert!(rt.run_until(WAIT, |core| core.is_empty()).unwrap());

    let request = proxy.join().unwrap();
    assert_eq!(request, [5, 1, 0, 1, 10, 1, 2, 3, 0x23, 0x29]);
}

#[test]
fn proxy_refusal_closes_the_link() {
    let (proxy_addr, proxy) = socks5_proxy(0, 5);
    let recorder = Recorder::default();
    let mut rt = runtime(CoreOptions::default()).with_processor(RoleKind::Relay, recorder.clone());

    let target: SocketAddr = "192.0.2.7:443".parse().unwrap();
    let opts = ConnectOptions::default()
        .through_proxy(ProxyConfig::new(ProxyProtocol::Socks5, proxy_addr));
    let id = rt.core_mut().connect(RoleKind::Relay, target.into(), opts).unwrap();

    assert!(rt.run_until(WAIT, |core| core.connection(id).is_none()).unwrap());
    proxy.join().unwrap();

    let seen = recorder.seen();
    assert!(seen.connected.is_empty());
    assert!(matches!(seen.closed.as_slice(), [(_, Some(CloseReason::Proxy(_)))]));
}

#[test]
fn proxies_are_for_relay_links() {
    let mut rt = runtime(CoreOptions::default());
    let proxy = ProxyConfig::new(ProxyProtocol::HttpConnect, "127.0.0.1:1".parse().unwrap());
    let err = rt
        .core_mut()
        .connect(
            RoleKind::Dir,
            "127.0.0.1:2".parse::<SocketAddr>().unwrap().into(),
            ConnectOptions::default().through_proxy(proxy),
        )
        .unwrap_err();
    assert!(matches!(err, ferry_net::Error::Unsupported(_)));
}
