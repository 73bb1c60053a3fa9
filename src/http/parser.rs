use crate::http::message::Message;
use crate::http::request::{is_token, Method};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidStatus,
    InvalidHeader,
    InvalidContentLength,
    LineTooLong,
    TooManyHeaders,
    Incomplete,
}

/// Limits applied while header bytes are accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    /// Longest accepted line, excluding the line terminator.
    pub max_line_length: usize,
    /// Most lines accepted in one header block, request line included.
    pub max_header_lines: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_line_length: 8190,
            max_header_lines: 100,
        }
    }
}

/// Parses a complete request (headers plus a `Content-Length` body) from `buf`.
///
/// Returns the request and the number of bytes it occupied, or
/// `ParseError::Incomplete` if more bytes are needed.
pub fn parse_http_request(buf: &[u8]) -> Result<(Message, usize), ParseError> {
    let mut request = Message::empty_request();
    let headers_end = request.append_data(buf)?;

    if !request.is_header_complete() {
        return Err(ParseError::Incomplete);
    }

    let content_length = request.content_length()?.unwrap_or(0);
    let body_bytes = &buf[headers_end..];

    if (body_bytes.len() as u64) < content_length {
        return Err(ParseError::Incomplete);
    }

    let content_length = content_length as usize;
    request.set_body(body_bytes[..content_length].to_vec());

    Ok((request, headers_end + content_length))
}

/// `METHOD SP target SP HTTP/x.y`
pub(crate) fn parse_request_line(line: &str) -> Result<(Method, String, String), ParseError> {
    let mut parts = line.split(' ');

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let target = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;

    if parts.next().is_some() || target.is_empty() || !is_http_version(version) {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;

    Ok((method, target.to_string(), version.to_string()))
}

/// `HTTP/x.y SP code SP reason`
pub(crate) fn parse_status_line(line: &str) -> Result<(String, u16, String), ParseError> {
    let mut parts = line.splitn(3, ' ');

    let version = parts.next().ok_or(ParseError::InvalidStatus)?;
    let code = parts.next().ok_or(ParseError::InvalidStatus)?;
    let reason = parts.next().unwrap_or("");

    if !is_http_version(version) || code.len() != 3 {
        return Err(ParseError::InvalidStatus);
    }

    let code = code.parse::<u16>().map_err(|_| ParseError::InvalidStatus)?;

    Ok((version.to_string(), code, reason.to_string()))
}

/// `name: value`. The name must be a token with no surrounding whitespace.
pub(crate) fn parse_header_line(line: &str) -> Result<(String, String), ParseError> {
    let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;

    if !is_token(key) {
        return Err(ParseError::InvalidHeader);
    }

    Ok((key.to_string(), value.trim().to_string()))
}

fn is_http_version(s: &str) -> bool {
    let Some(rest) = s.strip_prefix("HTTP/") else {
        return false;
    };
    let Some((major, minor)) = rest.split_once('.') else {
        return false;
    };
    !major.is_empty()
        && !minor.is_empty()
        && major.bytes().all(|b| b.is_ascii_digit())
        && minor.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (parsed, consumed) = parse_http_request(req).unwrap();

        assert_eq!(parsed.url(), Some("/"));
        assert_eq!(parsed.header_field("Host"), Some("example.com"));
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn request_line_needs_three_parts() {
        assert_eq!(
            parse_request_line("GET /"),
            Err(ParseError::InvalidRequest)
        );
        assert_eq!(
            parse_request_line("GET / HTTP/1.1 extra"),
            Err(ParseError::InvalidRequest)
        );
        assert_eq!(
            parse_request_line("GET / FTP/1.0"),
            Err(ParseError::InvalidRequest)
        );
    }

    #[test]
    fn header_name_must_be_token() {
        assert!(parse_header_line("Host: a").is_ok());
        assert_eq!(parse_header_line("Bad Name: a"), Err(ParseError::InvalidHeader));
        assert_eq!(parse_header_line("NoColonHere"), Err(ParseError::InvalidHeader));
        assert_eq!(parse_header_line(": empty"), Err(ParseError::InvalidHeader));
    }

    #[test]
    fn status_line() {
        let (v, code, reason) = parse_status_line("HTTP/1.1 206 Partial Content").unwrap();
        assert_eq!(v, "HTTP/1.1");
        assert_eq!(code, 206);
        assert_eq!(reason, "Partial Content");
    }
}
