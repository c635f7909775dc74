use std::{io, net::SocketAddr};

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

use ferry_common::errno;

/// Listen backlog for stream listeners.
pub const LISTEN_BACKLOG: i32 = 1024;

fn new_socket(addr: &SocketAddr) -> io::Result<Socket> {
    // socket2 sets close-on-exec on every socket it creates.
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Starts a non-blocking connect to `addr`, optionally from the local address `bind`.
///
/// The returned stream is usually still connecting: wait for writability, then call
/// [`finish_connect`].
pub fn connect(addr: SocketAddr, bind: Option<SocketAddr>) -> io::Result<TcpStream> {
    let socket = new_socket(&addr)?;
    if let Some(bind) = bind {
        socket.bind(&SockAddr::from(bind))?;
    }

    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => {}
        Err(e) if errno::is_connect_in_progress(&e) => {
            debug!(%addr, "Connect in progress");
        }
        Err(e) => return Err(e),
    }

    socket.set_nodelay(true)?;
    Ok(TcpStream::from_std(socket.into()))
}

/// Checks on a connect started by [`connect`]. Returns `Ok(true)` once established,
/// `Ok(false)` while still in progress, and the connect error if it failed.
pub fn finish_connect(stream: &TcpStream) -> io::Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }

    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected || errno::is_connect_in_progress(&e) => {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Binds a non-blocking stream listener on `addr`.
///
/// The socket gets `SO_REUSEADDR` so a restarted process can rebind right away, and IPv6
/// listeners are restricted to IPv6 so they don't claim the IPv4 port as well.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = new_socket(&addr)?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(TcpListener::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    fn wait_connected(stream: &TcpStream) {
        for _ in 0..200 {
            if finish_connect(stream).unwrap() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("connect never completed");
    }

    #[test]
    fn connect_to_listener() {
        let _ = tracing_subscriber::fmt::try_init();

        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = connect(addr, None).unwrap();
        wait_connected(&stream);
        assert_eq!(stream.peer_addr().unwrap(), addr);

        let mut accepted = None;
        for _ in 0..200 {
            match listener.accept() {
                Ok((s, peer)) => {
                    accepted = Some((s, peer));
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        let (_, peer) = accepted.expect("nothing accepted");
        assert_eq!(peer, stream.local_addr().unwrap());
    }

    #[test]
    fn connect_refused_surfaces() {
        let _ = tracing_subscriber::fmt::try_init();

        // Bind then drop to find a port with nobody listening.
        let addr = {
            let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
            listener.local_addr().unwrap()
        };

        let stream = match connect(addr, None) {
            Ok(stream) => stream,
            Err(e) => {
                assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused);
                return;
            }
        };

        for _ in 0..200 {
            match finish_connect(&stream) {
                Ok(false) => thread::sleep(Duration::from_millis(5)),
                Ok(true) => panic!("connected to a closed port"),
                Err(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused);
                    return;
                }
            }
        }
        panic!("connect never failed");
    }

    #[test]
    fn listener_rebinds_after_close() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let listener = bind_listener(addr).unwrap();
        assert_eq!(listener.local_addr().unwrap(), addr);
    }
}
