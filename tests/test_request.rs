use beacon::http::message::Message;
use beacon::http::request::{HTTP_1_0, HTTP_1_1, Method};

fn request(version: &str, headers: &[(&str, &str)]) -> Message {
    let mut msg = Message::request(Method::GET, "/", version);
    for (k, v) in headers {
        msg.set_header_field(*k, *v);
    }
    msg
}

#[test]
fn test_request_header_retrieval() {
    let req = request(
        HTTP_1_1,
        &[("Host", "example.com"), ("Content-Type", "application/json")],
    );

    assert_eq!(req.header_field("Host"), Some("example.com"));
    assert_eq!(req.header_field("Content-Type"), Some("application/json"));
    assert_eq!(req.header_field("Missing"), None);
}

#[test]
fn test_request_content_length_parsing() {
    let req = request(HTTP_1_1, &[("Content-Length", "42")]);
    assert_eq!(req.content_length(), Ok(Some(42)));
}

#[test]
fn test_request_content_length_missing() {
    let req = request(HTTP_1_1, &[]);
    assert_eq!(req.content_length(), Ok(None));
}

#[test]
fn test_request_content_length_invalid() {
    let req = request(HTTP_1_1, &[("Content-Length", "-1")]);
    assert!(req.content_length().is_err());
}

#[test]
fn test_request_keep_alive_http11_default() {
    assert!(request(HTTP_1_1, &[]).keep_alive());
}

#[test]
fn test_request_keep_alive_http10_needs_header() {
    assert!(!request(HTTP_1_0, &[]).keep_alive());
    assert!(request(HTTP_1_0, &[("Connection", "Keep-Alive")]).keep_alive());
}

#[test]
fn test_request_keep_alive_close() {
    assert!(!request(HTTP_1_1, &[("Connection", "close")]).keep_alive());
}

#[test]
fn test_request_method_from_string() {
    assert_eq!(Method::from_str("GET"), Some(Method::GET));
    assert_eq!(Method::from_str("POST"), Some(Method::POST));
    assert_eq!(Method::from_str("get"), Some(Method::Other("get".into())));
    assert_eq!(Method::from_str("BAD METHOD"), None);
    assert_eq!(Method::from_str(""), None);
}

#[test]
fn test_request_serialization() {
    let mut req = Message::request(Method::POST, "/api", HTTP_1_1);
    req.set_header_field("Host", "localhost");
    req.set_body(b"hi".to_vec());
    req.set_header_field("Content-Length", "2");

    assert_eq!(
        req.message_data(),
        b"POST /api HTTP/1.1\r\nHost: localhost\r\nContent-Length: 2\r\n\r\nhi".to_vec()
    );
}

#[test]
fn test_request_absolute_form_path() {
    let req = Message::request(Method::GET, "http://example.com/a%20b?x=1", HTTP_1_1);
    assert_eq!(req.path().as_deref(), Some("/a b"));
}
