//! Control port discovery and authentication material.
//!
//! Tor writes `control_auth_cookie` and `controlport` into its data
//! directory once the control listener is up. This module reads both files,
//! rejects anything that does not point at a localhost listener, and
//! implements the cookie and SAFECOOKIE handshakes.

use crate::error::{Result, TorControlError};
use crate::protocol::parse_kv_pairs;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Largest cookie Tor writes.
pub const MAX_COOKIE_LEN: usize = 32;

/// Required prefix of the control port file.
pub const PORT_FILE_PREFIX: &str = "PORT=127.0.0.1:";

/// Shortest well-formed port file, `PORT=1.1.1.1:1\n`.
pub const MIN_PORT_FILE_LEN: usize = 15;

/// Longest well-formed port file, `PORT=255.255.255.255:65535\n`.
pub const MAX_PORT_FILE_LEN: usize = 27;

const SAFECOOKIE_SERVER_KEY: &[u8] = b"Tor safe cookie authentication server-to-controller hash";
const SAFECOOKIE_CLIENT_KEY: &[u8] = b"Tor safe cookie authentication controller-to-server hash";

/// Port and cookie of a live control listener.
#[derive(Clone, PartialEq, Eq)]
pub struct ControlCredentials {
    /// TCP port on 127.0.0.1.
    pub port: u16,
    /// Raw cookie bytes.
    pub cookie: Vec<u8>,
}

impl std::fmt::Debug for ControlCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlCredentials")
            .field("port", &self.port)
            .field("cookie", &format_args!("[{} bytes]", self.cookie.len()))
            .finish()
    }
}

/// Read at most `limit + 1` bytes so oversized files are detectable.
fn read_limited(path: &Path, limit: usize) -> Result<(Vec<u8>, SystemTime)> {
    let file = File::open(path).map_err(|e| {
        TorControlError::Discovery(format!("failed to open '{}': {}", path.display(), e))
    })?;
    let modified = file.metadata()?.modified()?;

    let mut data = Vec::with_capacity(limit + 1);
    file.take(limit as u64 + 1).read_to_end(&mut data)?;
    Ok((data, modified))
}

/// Read the authentication cookie and its modification time.
pub fn read_control_cookie(path: &Path) -> Result<(Vec<u8>, SystemTime)> {
    let (cookie, modified) = read_limited(path, MAX_COOKIE_LEN)?;
    if cookie.len() > MAX_COOKIE_LEN {
        return Err(TorControlError::Discovery(format!(
            "cookie file '{}' is larger than {} bytes",
            path.display(),
            MAX_COOKIE_LEN
        )));
    }
    if cookie.is_empty() {
        return Err(TorControlError::Discovery(format!(
            "cookie file '{}' is empty",
            path.display()
        )));
    }
    Ok((cookie, modified))
}

/// Read the control port file and its modification time.
///
/// The file must read `PORT=127.0.0.1:<port>\n`; any other host is refused.
pub fn read_control_port(path: &Path) -> Result<(u16, SystemTime)> {
    let (data, modified) = read_limited(path, MAX_PORT_FILE_LEN)?;
    Ok((parse_control_port(&data)?, modified))
}

/// Parse the contents of a control port file.
pub fn parse_control_port(data: &[u8]) -> Result<u16> {
    let malformed = |reason: &str| TorControlError::Discovery(format!("control port file {reason}"));

    if data.len() < MIN_PORT_FILE_LEN {
        return Err(malformed("is truncated"));
    }
    if data.len() > MAX_PORT_FILE_LEN {
        return Err(malformed("is too long"));
    }
    let text = std::str::from_utf8(data).map_err(|_| malformed("is not text"))?;
    let text = text
        .strip_suffix('\n')
        .ok_or_else(|| malformed("is not newline-terminated"))?;
    if !text.starts_with("PORT=") {
        return Err(malformed("does not start with PORT="));
    }
    let port = text
        .strip_prefix(PORT_FILE_PREFIX)
        .ok_or_else(|| malformed("does not name 127.0.0.1"))?;
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed("has an invalid port"));
    }
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(malformed("has an invalid port")),
    }
}

/// Read both files from `dir` and check the cookie is not stale.
///
/// A cookie older than the port file belongs to a previous Tor instance.
/// Equal timestamps are accepted since filesystems round them.
pub fn discover(dir: &Path, cookie_file: &str, port_file: &str) -> Result<ControlCredentials> {
    let (cookie, cookie_mtime) = read_control_cookie(&dir.join(cookie_file))?;
    let (port, port_mtime) = read_control_port(&dir.join(port_file))?;

    if cookie_mtime < port_mtime {
        return Err(TorControlError::Discovery(
            "cookie file is older than control port file".to_string(),
        ));
    }

    debug!(port, dir = %dir.display(), "found control port");
    Ok(ControlCredentials { port, cookie })
}

/// Format cookie data as hex for the AUTHENTICATE command.
pub fn format_cookie_hex(cookie: &[u8]) -> String {
    hex::encode_upper(cookie)
}

/// The `AUTHENTICATE` line for plain cookie authentication.
pub fn cookie_authenticate_command(cookie: &[u8]) -> String {
    format!("AUTHENTICATE {}", format_cookie_hex(cookie))
}

/// Generate a random client nonce for SAFECOOKIE authentication.
pub fn generate_client_nonce() -> [u8; 32] {
    use rand::Rng;
    let mut nonce = [0u8; 32];
    rand::rng().fill(&mut nonce);
    nonce
}

fn safecookie_hmac(
    key: &[u8],
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| TorControlError::AuthenticationFailed(e.to_string()))?;
    mac.update(cookie);
    mac.update(client_nonce);
    mac.update(server_nonce);

    let mut hash = [0u8; 32];
    hash.copy_from_slice(&mac.finalize().into_bytes());
    Ok(hash)
}

/// Compute the server hash for SAFECOOKIE authentication.
pub fn compute_server_hash(
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<[u8; 32]> {
    safecookie_hmac(SAFECOOKIE_SERVER_KEY, cookie, client_nonce, server_nonce)
}

/// Compute the client hash for SAFECOOKIE authentication.
pub fn compute_client_hash(
    cookie: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<[u8; 32]> {
    safecookie_hmac(SAFECOOKIE_CLIENT_KEY, cookie, client_nonce, server_nonce)
}

/// Parse the body of a `250 AUTHCHALLENGE ...` reply.
///
/// Returns `(server_hash, server_nonce)`.
pub fn parse_authchallenge_response(body: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let args = body.strip_prefix("AUTHCHALLENGE ").ok_or_else(|| {
        TorControlError::ProtocolError(format!("unexpected AUTHCHALLENGE reply: {}", body))
    })?;

    let mut server_hash = None;
    let mut server_nonce = None;
    for (key, value) in parse_kv_pairs(args.as_bytes())? {
        let decoded = hex::decode(&value).map_err(|e| {
            TorControlError::ProtocolError(format!("invalid {} hex: {}", key, e))
        })?;
        match key.as_str() {
            "SERVERHASH" => server_hash = Some(decoded),
            "SERVERNONCE" => server_nonce = Some(decoded),
            _ => {}
        }
    }

    let server_hash = server_hash
        .ok_or_else(|| TorControlError::ProtocolError("Missing SERVERHASH".to_string()))?;
    let server_nonce = server_nonce
        .ok_or_else(|| TorControlError::ProtocolError("Missing SERVERNONCE".to_string()))?;

    if server_hash.len() != 32 {
        return Err(TorControlError::ProtocolError(format!(
            "Invalid SERVERHASH length: {}",
            server_hash.len()
        )));
    }
    if server_nonce.len() != 32 {
        return Err(TorControlError::ProtocolError(format!(
            "Invalid SERVERNONCE length: {}",
            server_nonce.len()
        )));
    }

    Ok((server_hash, server_nonce))
}

/// Check the server's hash and produce the client's `AUTHENTICATE` line.
pub fn safecookie_response(
    cookie: &[u8],
    client_nonce: &[u8],
    challenge_body: &str,
) -> Result<String> {
    let (server_hash, server_nonce) = parse_authchallenge_response(challenge_body)?;
    let expected = compute_server_hash(cookie, client_nonce, &server_nonce)?;
    if !constant_time_compare(&expected, &server_hash) {
        return Err(TorControlError::AuthenticationFailed(
            "server hash does not match cookie".to_string(),
        ));
    }
    let client_hash = compute_client_hash(cookie, client_nonce, &server_nonce)?;
    Ok(format!("AUTHENTICATE {}", hex::encode_upper(client_hash)))
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_with_mtime(path: &Path, contents: &[u8], mtime: SystemTime) {
        std::fs::write(path, contents).unwrap();
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn test_parse_control_port() {
        assert_eq!(parse_control_port(b"PORT=127.0.0.1:9051\n").unwrap(), 9051);
        assert_eq!(parse_control_port(b"PORT=127.0.0.1:1\n").unwrap(), 1);
        assert_eq!(parse_control_port(b"PORT=127.0.0.1:65535\n").unwrap(), 65535);
    }

    #[test]
    fn test_parse_control_port_rejects() {
        // Not localhost.
        assert!(parse_control_port(b"PORT=10.0.0.1:9051\n").is_err());
        assert!(parse_control_port(b"PORT=255.255.255.255:9051\n").is_err());
        // Missing newline, truncated, garbage.
        assert!(parse_control_port(b"PORT=127.0.0.1:9051").is_err());
        assert!(parse_control_port(b"PORT=1.1.1.1\n").is_err());
        assert!(parse_control_port(b"HOST=127.0.0.1:9051\n").is_err());
        assert!(parse_control_port(b"PORT=127.0.0.1:90x1\n").is_err());
        assert!(parse_control_port(b"PORT=127.0.0.1:99999\n").is_err());
        assert!(parse_control_port(b"PORT=127.0.0.1:0\n").is_err());
        assert!(parse_control_port(b"PORT=127.0.0.1:9051\n\n\n\n\n\n\n\n\n").is_err());
    }

    #[test]
    fn test_read_control_cookie_limits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control_auth_cookie");

        std::fs::write(&path, [7u8; 32]).unwrap();
        let (cookie, _) = read_control_cookie(&path).unwrap();
        assert_eq!(cookie, vec![7u8; 32]);

        std::fs::write(&path, [7u8; 33]).unwrap();
        assert!(read_control_cookie(&path).is_err());

        assert!(read_control_cookie(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_discover() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        write_with_mtime(&dir.path().join("controlport"), b"PORT=127.0.0.1:9151\n", now);
        write_with_mtime(&dir.path().join("control_auth_cookie"), &[1u8; 32], now);

        let creds = discover(dir.path(), "control_auth_cookie", "controlport").unwrap();
        assert_eq!(creds.port, 9151);
        assert_eq!(creds.cookie, vec![1u8; 32]);
    }

    #[test]
    fn test_discover_rejects_stale_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        write_with_mtime(&dir.path().join("controlport"), b"PORT=127.0.0.1:9151\n", now);
        write_with_mtime(
            &dir.path().join("control_auth_cookie"),
            &[1u8; 32],
            now - Duration::from_secs(60),
        );

        let err = discover(dir.path(), "control_auth_cookie", "controlport").unwrap_err();
        assert!(matches!(err, TorControlError::Discovery(_)));
    }

    #[test]
    fn test_discover_missing_port_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("control_auth_cookie"), [1u8; 32]).unwrap();
        assert!(discover(dir.path(), "control_auth_cookie", "controlport").is_err());
    }

    #[test]
    fn test_cookie_authenticate_command() {
        assert_eq!(
            cookie_authenticate_command(&[0xde, 0xad, 0xbe, 0xef]),
            "AUTHENTICATE DEADBEEF"
        );
    }

    #[test]
    fn test_client_nonce_generation() {
        let nonce1 = generate_client_nonce();
        let nonce2 = generate_client_nonce();
        assert_ne!(nonce1, nonce2);
    }

    #[test]
    fn test_safecookie_exchange() {
        let cookie = [0u8; 32];
        let client_nonce = [1u8; 32];
        let server_nonce = [2u8; 32];

        let server_hash = compute_server_hash(&cookie, &client_nonce, &server_nonce).unwrap();
        let client_hash = compute_client_hash(&cookie, &client_nonce, &server_nonce).unwrap();
        assert_ne!(server_hash, client_hash);

        let body = format!(
            "AUTHCHALLENGE SERVERHASH={} SERVERNONCE={}",
            hex::encode_upper(server_hash),
            hex::encode_upper(server_nonce)
        );
        let line = safecookie_response(&cookie, &client_nonce, &body).unwrap();
        assert_eq!(line, format!("AUTHENTICATE {}", hex::encode_upper(client_hash)));

        // A server that does not know the cookie is refused.
        let forged = format!(
            "AUTHCHALLENGE SERVERHASH={} SERVERNONCE={}",
            hex::encode_upper(client_hash),
            hex::encode_upper(server_nonce)
        );
        assert!(safecookie_response(&cookie, &client_nonce, &forged).is_err());
    }

    #[test]
    fn test_parse_authchallenge_rejects() {
        assert!(parse_authchallenge_response("SERVERHASH=00").is_err());
        assert!(parse_authchallenge_response("AUTHCHALLENGE SERVERHASH=00 SERVERNONCE=00").is_err());
        assert!(parse_authchallenge_response("AUTHCHALLENGE SERVERNONCE=zz").is_err());
    }
}
