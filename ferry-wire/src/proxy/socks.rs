use std::net::IpAddr;

use crate::buf::Buffer;

use super::{ProxyCredentials, ProxyError, ProxyTarget, Step, TargetHost};

/// Longest username or password in an RFC 1929 sub-negotiation.
pub const MAX_SOCKS5_AUTH_FIELD_SIZE: usize = 255;
/// Longest username and password together.
pub const MAX_SOCKS5_AUTH_SIZE_TOTAL: usize = 2 * MAX_SOCKS5_AUTH_FIELD_SIZE;

const SOCKS4_VERSION: u8 = 4;
const SOCKS5_VERSION: u8 = 5;
const USERPASS_VERSION: u8 = 1;
const CMD_CONNECT: u8 = 1;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

const SOCKS4_GRANTED: u8 = 0x5a;
const SOCKS4_REPLY_LEN: usize = 8;

/// Returns a human-readable reason for a SOCKS5 reply code.
pub fn socks5_reply_reason(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "Network unreachable",
        0x04 => "Host unreachable",
        0x05 => "Connection refused",
        0x06 => "TTL expired",
        0x07 => "Command not supported",
        0x08 => "Address type not supported",
        _ => "unknown reason",
    }
}

/// `VER CMD DSTPORT DSTIP USERID NUL`
pub(super) fn write_socks4_request(
    out: &mut Buffer,
    target: &ProxyTarget,
    userid: &[u8],
) -> Result<(), ProxyError> {
    let TargetHost::Ip(IpAddr::V4(ip)) = &target.host else {
        return Err(ProxyError::InvalidRequest(
            "SOCKS4 can only reach IPv4 addresses".to_string(),
        ));
    };
    if userid.contains(&0) {
        return Err(ProxyError::InvalidRequest("SOCKS4 user id contains a NUL byte".to_string()));
    }

    let mut req = Vec::with_capacity(9 + userid.len());
    req.extend_from_slice(&[SOCKS4_VERSION, CMD_CONNECT]);
    req.extend_from_slice(&target.port.to_be_bytes());
    req.extend_from_slice(&ip.octets());
    req.extend_from_slice(userid);
    req.push(0);
    out.append(&req);
    Ok(())
}

pub(super) fn parse_socks4_reply(inbuf: &mut Buffer) -> Result<Step, ProxyError> {
    if inbuf.len() < SOCKS4_REPLY_LEN {
        return Ok(Step::NeedMore);
    }

    let mut reply = [0u8; SOCKS4_REPLY_LEN];
    inbuf.get_bytes(&mut reply);

    if reply[0] != 0 {
        return Err(ProxyError::Malformed(format!("SOCKS4 reply has version {}", reply[0])));
    }

    match reply[1] {
        SOCKS4_GRANTED => Ok(Step::Ok),
        0x5b => Err(ProxyError::Rejected("server rejected connection".to_string())),
        0x5c => Err(ProxyError::Rejected(
            "server cannot connect to identd on this client".to_string(),
        )),
        0x5d => Err(ProxyError::Rejected("user id does not match identd".to_string())),
        other => Err(ProxyError::Malformed(format!("unknown SOCKS4 status {other:#x}"))),
    }
}

pub(super) fn write_socks5_greeting(out: &mut Buffer, offer_userpass: bool) {
    if offer_userpass {
        out.append(&[SOCKS5_VERSION, 2, METHOD_NO_AUTH, METHOD_USERPASS]);
    } else {
        out.append(&[SOCKS5_VERSION, 1, METHOD_NO_AUTH]);
    }
}

pub(super) fn parse_method_reply(inbuf: &mut Buffer, offered_userpass: bool) -> Result<Step, ProxyError> {
    if inbuf.len() < 2 {
        return Ok(Step::NeedMore);
    }

    let mut reply = [0u8; 2];
    inbuf.get_bytes(&mut reply);

    if reply[0] != SOCKS5_VERSION {
        return Err(ProxyError::Malformed(format!(
            "SOCKS5 method reply has version {}",
            reply[0]
        )));
    }

    match reply[1] {
        METHOD_NO_AUTH => Ok(Step::Ok),
        METHOD_USERPASS if offered_userpass => Ok(Step::AuthRequired),
        METHOD_NONE_ACCEPTABLE => Err(ProxyError::Rejected(
            "server doesn't support any of our available authentication methods".to_string(),
        )),
        other => Err(ProxyError::Malformed(format!(
            "server picked authentication method {other:#x}, which we did not offer"
        ))),
    }
}

/// RFC 1929: `VER ULEN UNAME PLEN PASSWD`
pub(super) fn write_userpass_auth(
    out: &mut Buffer,
    credentials: &ProxyCredentials,
) -> Result<(), ProxyError> {
    let (user, pass) = (&credentials.username, &credentials.password);
    if user.is_empty() || user.len() > MAX_SOCKS5_AUTH_FIELD_SIZE {
        return Err(ProxyError::InvalidRequest(format!(
            "SOCKS5 username must be 1 to {MAX_SOCKS5_AUTH_FIELD_SIZE} bytes"
        )));
    }
    if pass.is_empty() || pass.len() > MAX_SOCKS5_AUTH_FIELD_SIZE {
        return Err(ProxyError::InvalidRequest(format!(
            "SOCKS5 password must be 1 to {MAX_SOCKS5_AUTH_FIELD_SIZE} bytes"
        )));
    }

    let mut req = Vec::with_capacity(3 + user.len() + pass.len());
    req.push(USERPASS_VERSION);
    req.push(user.len() as u8);
    req.extend_from_slice(user);
    req.push(pass.len() as u8);
    req.extend_from_slice(pass);
    out.append(&req);
    Ok(())
}

pub(super) fn parse_auth_reply(inbuf: &mut Buffer) -> Result<Step, ProxyError> {
    if inbuf.len() < 2 {
        return Ok(Step::NeedMore);
    }

    let mut reply = [0u8; 2];
    inbuf.get_bytes(&mut reply);

    if reply[0] != USERPASS_VERSION {
        return Err(ProxyError::Malformed(format!(
            "SOCKS5 authentication reply has version {}",
            reply[0]
        )));
    }
    if reply[1] != 0 {
        return Err(ProxyError::Rejected("authentication failed".to_string()));
    }
    Ok(Step::Ok)
}

/// `VER CMD RSV ATYP DST.ADDR DST.PORT`
pub(super) fn write_socks5_connect(out: &mut Buffer, target: &ProxyTarget) -> Result<(), ProxyError> {
    let mut req = vec![SOCKS5_VERSION, CMD_CONNECT, 0];
    match &target.host {
        TargetHost::Ip(IpAddr::V4(ip)) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&ip.octets());
        }
        TargetHost::Ip(IpAddr::V6(ip)) => {
            req.push(ATYP_IPV6);
            req.extend_from_slice(&ip.octets());
        }
        TargetHost::Domain(name) => {
            if name.is_empty() || name.len() > u8::MAX as usize {
                return Err(ProxyError::InvalidRequest(format!(
                    "hostname must be 1 to 255 bytes, got {}",
                    name.len()
                )));
            }
            req.push(ATYP_DOMAIN);
            req.push(name.len() as u8);
            req.extend_from_slice(name.as_bytes());
        }
    }
    req.extend_from_slice(&target.port.to_be_bytes());
    out.append(&req);
    Ok(())
}

pub(super) fn parse_connect_reply(inbuf: &mut Buffer) -> Result<Step, ProxyError> {
    // VER REP RSV ATYP, plus the domain length byte when present.
    if inbuf.len() < 5 {
        return Ok(Step::NeedMore);
    }

    let mut head = [0u8; 5];
    inbuf.peek(&mut head);

    if head[0] != SOCKS5_VERSION {
        return Err(ProxyError::Malformed(format!("SOCKS5 reply has version {}", head[0])));
    }

    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => 1 + head[4] as usize,
        other => {
            return Err(ProxyError::Malformed(format!("SOCKS5 reply has address type {other}")))
        }
    };

    let total = 4 + addr_len + 2;
    if inbuf.len() < total {
        return Ok(Step::NeedMore);
    }
    inbuf.drain(total);

    match head[1] {
        0x00 => Ok(Step::Ok),
        code => Err(ProxyError::Rejected(socks5_reply_reason(code).to_string())),
    }
}
