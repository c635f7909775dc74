use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use mio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// Starts a non-blocking connect to the socket at `path`.
pub fn connect(path: &Path) -> io::Result<UnixStream> {
    UnixStream::connect(path)
}

/// Checks on a connect started by [`connect`], like [`crate::tcp::finish_connect`].
pub fn finish_connect(stream: &UnixStream) -> io::Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }

    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

/// A listening Unix-domain socket that owns its socket file.
pub struct UnixListenerHandle {
    listener: UnixListener,
    path: PathBuf,
}

impl fmt::Debug for UnixListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnixListenerHandle").field("path", &self.path).finish()
    }
}

impl UnixListenerHandle {
    /// Binds a listener at `path`, removing a stale socket file left behind by a previous
    /// process first.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if path.exists() {
            debug!(path = ?path, "Socket file already exists, removing it");
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn accept(&self) -> io::Result<UnixStream> {
        self.listener.accept().map(|(stream, _)| stream)
    }

    pub fn source(&mut self) -> &mut UnixListener {
        &mut self.listener
    }
}

impl Drop for UnixListenerHandle {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = ?self.path, ?e, "Failed to remove socket file");
        }
    }
}
