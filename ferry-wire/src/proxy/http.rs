use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::debug;

use crate::buf::Buffer;

use super::{ProxyCredentials, ProxyError, ProxyTarget, Step};

/// We refuse to buffer more than this many bytes of response headers.
pub const MAX_HEADERS_SIZE: usize = 50_000;

const HEADER_END: &[u8] = b"\r\n\r\n";

pub(super) fn write_connect_request(
    out: &mut Buffer,
    target: &ProxyTarget,
    credentials: Option<&ProxyCredentials>,
) {
    out.append_fmt(format_args!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n"));

    if let Some(credentials) = credentials {
        let mut userpass = credentials.username.clone();
        userpass.push(b':');
        userpass.extend_from_slice(&credentials.password);
        out.append_fmt(format_args!("Proxy-Authorization: Basic {}\r\n", STANDARD.encode(userpass)));
    }

    out.append(b"\r\n");
}

pub(super) fn parse_connect_response(inbuf: &mut Buffer) -> Result<Step, ProxyError> {
    let Some(end) = inbuf.find_substring(HEADER_END) else {
        if inbuf.len() > MAX_HEADERS_SIZE {
            return Err(ProxyError::Malformed(format!(
                "response headers exceed {MAX_HEADERS_SIZE} bytes"
            )));
        }
        return Ok(Step::NeedMore);
    };

    let mut headers = vec![0u8; end + HEADER_END.len()];
    inbuf.get_bytes(&mut headers);

    let (status, reason) = parse_status_line(&headers)?;
    if status == 200 {
        debug!(status, "HTTP CONNECT tunnel established");
        return Ok(Step::Ok);
    }

    Err(ProxyError::Rejected(format!("HTTP CONNECT failed with status code {status} ({reason})")))
}

/// Parses `HTTP/1.x NNN reason` from the first header line.
fn parse_status_line(headers: &[u8]) -> Result<(u16, String), ProxyError> {
    let malformed = || ProxyError::Malformed("unparseable HTTP status line".to_string());

    let line_end = headers.windows(2).position(|w| w == b"\r\n").ok_or_else(malformed)?;
    let line = std::str::from_utf8(&headers[..line_end]).map_err(|_| malformed())?;

    let rest = line.strip_prefix("HTTP/1.").ok_or_else(malformed)?;
    let mut parts = rest.splitn(3, ' ');
    let minor = parts.next().ok_or_else(malformed)?;
    if minor.len() != 1 || !minor.as_bytes()[0].is_ascii_digit() {
        return Err(malformed());
    }

    let code = parts.next().ok_or_else(malformed)?;
    if code.len() != 3 {
        return Err(malformed());
    }
    let status = code.parse::<u16>().map_err(|_| malformed())?;
    let reason = parts.next().unwrap_or("").trim().to_string();

    Ok((status, reason))
}
