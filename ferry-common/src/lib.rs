use std::io;

/// Returns the soft limit on open file descriptors for this process.
pub fn descriptor_limit() -> io::Result<u64> {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: `limit` is a valid, writable rlimit struct.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(limit.rlim_cur as u64)
}

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u32 = 1024;
    pub const MiB: u32 = 1024 * KiB;
    pub const GiB: u32 = 1024 * MiB;
}

/// Helpers to classify raw OS errors the way the event loop needs them.
pub mod errno {
    use super::io;

    /// Returns `true` if the error means the process (or the system) ran out of a resource
    /// needed to create a socket: descriptors, buffer space or kernel memory.
    pub fn is_resource_exhaustion(err: &io::Error) -> bool {
        matches!(
            err.raw_os_error(),
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
        )
    }

    /// Returns `true` if a non-blocking `connect(2)` reported that the connection is still
    /// being established.
    pub fn is_connect_in_progress(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::WouldBlock ||
            matches!(err.raw_os_error(), Some(libc::EINPROGRESS) | Some(libc::EALREADY))
    }

    /// Returns `true` if `accept(2)` failed only for the connection it was about to return
    /// (it vanished before we got to it, or a signal interrupted the call). Other pending
    /// connections can still be accepted.
    pub fn is_accept_retryable(err: &io::Error) -> bool {
        matches!(err.kind(), io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted) ||
            err.raw_os_error() == Some(libc::EPROTO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_detected_from_raw_errno() {
        assert!(errno::is_resource_exhaustion(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(errno::is_resource_exhaustion(&io::Error::from_raw_os_error(libc::ENFILE)));
        assert!(!errno::is_resource_exhaustion(&io::Error::from_raw_os_error(libc::ECONNRESET)));
        assert!(!errno::is_resource_exhaustion(&io::Error::new(io::ErrorKind::Other, "x")));
    }

    #[test]
    fn in_progress_connects() {
        assert!(errno::is_connect_in_progress(&io::Error::from_raw_os_error(libc::EINPROGRESS)));
        assert!(errno::is_connect_in_progress(&io::ErrorKind::WouldBlock.into()));
        assert!(!errno::is_connect_in_progress(&io::ErrorKind::ConnectionRefused.into()));
    }

    #[test]
    fn retryable_accepts() {
        assert!(errno::is_accept_retryable(&io::ErrorKind::ConnectionAborted.into()));
        assert!(errno::is_accept_retryable(&io::Error::from_raw_os_error(libc::EPROTO)));
        assert!(!errno::is_accept_retryable(&io::ErrorKind::WouldBlock.into()));
        assert!(!errno::is_accept_retryable(&io::Error::from_raw_os_error(libc::EMFILE)));
    }

    #[test]
    fn descriptor_limit_is_positive() {
        assert!(descriptor_limit().unwrap() > 0);
    }
}
