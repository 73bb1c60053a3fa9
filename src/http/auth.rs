//! HTTP Basic and Digest (RFC 2617, `qop=auth`) authentication.
//!
//! [`Credentials`] is what a client sent in `Authorization`. Whether it is
//! good enough is decided by [`authenticate`], which needs the password
//! lookup of the host and the [`NonceTracker`] of the server that issued the
//! challenge.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use base64::Engine;
use md5::{Digest, Md5};

use crate::http::message::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingHeader,
    UnsupportedScheme,
    MissingField(&'static str),
    Malformed,
    /// The scheme is valid but not the one the server asks for.
    WrongScheme,
    UnknownUser,
    UnknownNonce,
    /// `nc` did not increase for this nonce.
    Replay,
    BadCredentials,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic(BasicCredentials),
    Digest(DigestCredentials),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    /// The base64 payload exactly as sent.
    pub credentials_base64: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub qop: String,
    pub nc: String,
    pub cnonce: String,
    pub response: String,
}

impl Credentials {
    pub fn from_request(request: &Message) -> Result<Self, AuthError> {
        let value = request
            .header_field("Authorization")
            .ok_or(AuthError::MissingHeader)?;
        Self::from_header(value)
    }

    /// Parses an `Authorization` header value.
    pub fn from_header(value: &str) -> Result<Self, AuthError> {
        let value = value.trim();
        let (scheme, rest) = value
            .split_once(|c: char| c.is_ascii_whitespace())
            .unwrap_or((value, ""));
        let rest = rest.trim();

        if scheme.eq_ignore_ascii_case("Basic") {
            if rest.is_empty() {
                return Err(AuthError::MissingField("credentials"));
            }
            Ok(Credentials::Basic(BasicCredentials {
                credentials_base64: rest.to_string(),
            }))
        } else if scheme.eq_ignore_ascii_case("Digest") {
            let mut params = parse_params(rest)?;
            let mut take = |name: &'static str| {
                params
                    .remove(name)
                    .filter(|v| !v.is_empty())
                    .ok_or(AuthError::MissingField(name))
            };
            Ok(Credentials::Digest(DigestCredentials {
                username: take("username")?,
                realm: take("realm")?,
                nonce: take("nonce")?,
                uri: take("uri")?,
                qop: take("qop")?,
                nc: take("nc")?,
                cnonce: take("cnonce")?,
                response: take("response")?,
            }))
        } else {
            Err(AuthError::UnsupportedScheme)
        }
    }
}

impl BasicCredentials {
    /// Decodes the payload into `(username, password)`.
    pub fn decode(&self) -> Result<(String, String), AuthError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(self.credentials_base64.as_bytes())
            .map_err(|_| AuthError::Malformed)?;
        let text = String::from_utf8(raw).map_err(|_| AuthError::Malformed)?;
        let (user, pass) = text.split_once(':').ok_or(AuthError::Malformed)?;
        Ok((user.to_string(), pass.to_string()))
    }
}

impl DigestCredentials {
    /// The `response` value a client knowing `password` would have sent.
    pub fn expected_response(&self, password: &str, method: &str) -> String {
        let ha1 = md5_hex(format!("{}:{}:{}", self.username, self.realm, password));
        let ha2 = md5_hex(format!("{}:{}", method, self.uri));
        md5_hex(format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, self.nonce, self.nc, self.cnonce, self.qop, ha2
        ))
    }

    pub fn verify(&self, password: &str, method: &str) -> bool {
        self.expected_response(password, method)
            .eq_ignore_ascii_case(&self.response)
    }
}

fn md5_hex(input: String) -> String {
    Md5::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Splits `k=v, k="quoted, \"value\""` into a map with lowercase keys.
fn parse_params(s: &str) -> Result<HashMap<String, String>, AuthError> {
    let mut params = HashMap::new();
    let mut chars = s.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) => key.push(c),
                None => return Err(AuthError::Malformed),
            }
        }
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(AuthError::Malformed);
        }

        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => value.push(chars.next().ok_or(AuthError::Malformed)?),
                    Some(c) => value.push(c),
                    None => return Err(AuthError::Malformed),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        params.insert(key, value);
    }

    Ok(params)
}

/// How long an issued nonce stays acceptable.
pub const DEFAULT_NONCE_LIFETIME: Duration = Duration::from_secs(300);
/// Outstanding nonces kept server-wide; the oldest goes first.
pub const DEFAULT_MAX_NONCES: usize = 1024;

#[derive(Debug)]
struct NonceEntry {
    last_nc: u64,
    issued: Instant,
}

#[derive(Debug, Default)]
struct Nonces {
    entries: HashMap<String, NonceEntry>,
    // Issue order, oldest first. May hold nonces already retired.
    order: VecDeque<String>,
}

/// Server-side record of issued nonces and the highest `nc` seen for each.
///
/// Nonces are not tied to the connection that sent the challenge: a client
/// may answer on a fresh connection. They expire after `lifetime`, and
/// issuing beyond `capacity` evicts the oldest.
#[derive(Debug)]
pub struct NonceTracker {
    nonces: Mutex<Nonces>,
    lifetime: Duration,
    capacity: usize,
}

impl Default for NonceTracker {
    fn default() -> Self {
        Self::with_limits(DEFAULT_NONCE_LIFETIME, DEFAULT_MAX_NONCES)
    }
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(lifetime: Duration, capacity: usize) -> Self {
        Self {
            nonces: Mutex::new(Nonces::default()),
            lifetime,
            capacity: capacity.max(1),
        }
    }

    /// Creates and remembers a fresh nonce.
    pub fn issue(&self) -> String {
        let bytes: [u8; 16] = rand::random();
        let nonce: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();

        let mut nonces = self.lock();
        self.evict(&mut nonces);
        nonces.entries.insert(
            nonce.clone(),
            NonceEntry {
                last_nc: 0,
                issued: Instant::now(),
            },
        );
        nonces.order.push_back(nonce.clone());
        nonce
    }

    pub fn is_issued(&self, nonce: &str) -> bool {
        self.lock()
            .entries
            .get(nonce)
            .is_some_and(|entry| self.is_fresh(entry))
    }

    /// Accepts `nc` (hex) for `nonce` only if it is larger than any seen so far.
    pub fn record(&self, nonce: &str, nc: &str) -> Result<(), AuthError> {
        let nc = u64::from_str_radix(nc, 16).map_err(|_| AuthError::Malformed)?;
        let mut nonces = self.lock();
        let entry = nonces
            .entries
            .get_mut(nonce)
            .filter(|entry| entry.issued.elapsed() < self.lifetime)
            .ok_or(AuthError::UnknownNonce)?;
        if nc <= entry.last_nc {
            return Err(AuthError::Replay);
        }
        entry.last_nc = nc;
        Ok(())
    }

    pub fn retire(&self, nonce: &str) {
        self.lock().entries.remove(nonce);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_fresh(&self, entry: &NonceEntry) -> bool {
        entry.issued.elapsed() < self.lifetime
    }

    // Drops expired nonces from the front and makes room for one more.
    fn evict(&self, nonces: &mut Nonces) {
        while let Some(oldest) = nonces.order.front() {
            let expired = match nonces.entries.get(oldest) {
                Some(entry) => !self.is_fresh(entry),
                None => true,
            };
            if !expired && nonces.entries.len() < self.capacity {
                break;
            }
            if let Some(oldest) = nonces.order.pop_front() {
                nonces.entries.remove(&oldest);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Nonces> {
        self.nonces.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Checks the credentials on `request`.
///
/// `use_digest` selects which scheme is acceptable. `password_for_user`
/// looks up the expected password. Returns the authenticated user name.
pub fn authenticate<F>(
    request: &Message,
    use_digest: bool,
    password_for_user: F,
    nonces: &NonceTracker,
) -> Result<String, AuthError>
where
    F: Fn(&str) -> Option<String>,
{
    match Credentials::from_request(request)? {
        Credentials::Basic(_) if use_digest => Err(AuthError::WrongScheme),
        Credentials::Digest(_) if !use_digest => Err(AuthError::WrongScheme),

        Credentials::Basic(basic) => {
            let (user, pass) = basic.decode()?;
            let expected = password_for_user(&user).ok_or(AuthError::UnknownUser)?;
            if expected != pass {
                return Err(AuthError::BadCredentials);
            }
            Ok(user)
        }

        Credentials::Digest(digest) => {
            let password = password_for_user(&digest.username).ok_or(AuthError::UnknownUser)?;

            if !nonces.is_issued(&digest.nonce) {
                return Err(AuthError::UnknownNonce);
            }
            if request.url() != Some(digest.uri.as_str()) {
                return Err(AuthError::BadCredentials);
            }

            let method = request.method().map(|m| m.as_str()).unwrap_or("");
            if !digest.verify(&password, method) {
                return Err(AuthError::BadCredentials);
            }

            // Only a correct response may advance the counter.
            nonces.record(&digest.nonce, &digest.nc)?;
            Ok(digest.username)
        }
    }
}

pub fn basic_challenge(realm: &str) -> String {
    format!("Basic realm=\"{}\"", realm)
}

pub fn digest_challenge(realm: &str, nonce: &str) -> String {
    format!("Digest realm=\"{}\", qop=\"auth\", nonce=\"{}\"", realm, nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_values_may_contain_commas() {
        let p = parse_params(r#"a="x, y", b=token , c="q\"uote""#).unwrap();
        assert_eq!(p["a"], "x, y");
        assert_eq!(p["b"], "token");
        assert_eq!(p["c"], "q\"uote");
    }

    #[test]
    fn unterminated_quote_is_malformed() {
        assert_eq!(parse_params(r#"a="x"#), Err(AuthError::Malformed));
    }

    #[test]
    fn nc_must_increase() {
        let t = NonceTracker::new();
        let n = t.issue();
        assert_eq!(t.record(&n, "00000001"), Ok(()));
        assert_eq!(t.record(&n, "00000001"), Err(AuthError::Replay));
        assert_eq!(t.record(&n, "00000002"), Ok(()));
        assert_eq!(t.record("other", "00000003"), Err(AuthError::UnknownNonce));
    }

    #[test]
    fn oldest_nonce_evicted_at_capacity() {
        let t = NonceTracker::with_limits(DEFAULT_NONCE_LIFETIME, 2);
        let first = t.issue();
        let second = t.issue();
        let third = t.issue();
        assert!(!t.is_issued(&first));
        assert!(t.is_issued(&second));
        assert!(t.is_issued(&third));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn expired_nonce_is_unknown() {
        let t = NonceTracker::with_limits(Duration::ZERO, 8);
        let n = t.issue();
        assert!(!t.is_issued(&n));
        assert_eq!(t.record(&n, "00000001"), Err(AuthError::UnknownNonce));
    }
}
