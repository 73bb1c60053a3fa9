use beacon::http::headers::HeaderMap;
use beacon::http::message::Message;
use beacon::http::response::{
    ChunkedResponse, DataResponse, HttpResponse, RedirectResponse, StatusCode, error_response,
};

#[test]
fn test_status_code_as_u16() {
    assert_eq!(StatusCode::SwitchingProtocols.as_u16(), 101);
    assert_eq!(StatusCode::Ok.as_u16(), 200);
    assert_eq!(StatusCode::PartialContent.as_u16(), 206);
    assert_eq!(StatusCode::BadRequest.as_u16(), 400);
    assert_eq!(StatusCode::Unauthorized.as_u16(), 401);
    assert_eq!(StatusCode::NotFound.as_u16(), 404);
    assert_eq!(StatusCode::MethodNotAllowed.as_u16(), 405);
    assert_eq!(StatusCode::RangeNotSatisfiable.as_u16(), 416);
    assert_eq!(StatusCode::InternalServerError.as_u16(), 500);
    assert_eq!(StatusCode::VersionNotSupported.as_u16(), 505);
}

#[test]
fn test_status_code_reason_phrase() {
    assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    assert_eq!(StatusCode::PartialContent.reason_phrase(), "Partial Content");
    assert_eq!(
        StatusCode::RangeNotSatisfiable.reason_phrase(),
        "Requested Range Not Satisfiable"
    );
    assert_eq!(
        StatusCode::MethodNotAllowed.reason_phrase(),
        "Method Not Allowed"
    );
}

#[test]
fn test_error_response_serialization() {
    let msg = error_response(StatusCode::NotFound, "HTTP/1.1");
    assert_eq!(
        msg.message_data(),
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec()
    );
}

#[test]
fn test_status_line_round_trip() {
    let msg = Message::with_status(StatusCode::PartialContent, "HTTP/1.1");
    let mut parsed = Message::empty_response();
    parsed.append_data(&msg.header_data()).unwrap();

    assert!(parsed.is_header_complete());
    assert_eq!(parsed.status_code(), Some(206));
    assert_eq!(parsed.reason_phrase(), Some("Partial Content"));
}

#[test]
fn test_data_response_capabilities() {
    let response = HttpResponse::Data(
        DataResponse::new("{}")
            .with_content_type("application/json")
            .with_header("Cache-Control", "no-cache"),
    );

    assert_eq!(response.status(), StatusCode::Ok);
    assert_eq!(response.content_length(), Some(2));
    assert!(response.supports_ranges());
    assert!(!response.is_async());
    assert!(!response.is_chunked());
    assert_eq!(response.content_type(), Some("application/json"));
    assert_eq!(response.headers().get("cache-control"), Some("no-cache"));
}

#[test]
fn test_error_data_response_is_not_rangeable() {
    let response = HttpResponse::Data(DataResponse::new("nope").with_status(StatusCode::NotFound));
    assert!(!response.supports_ranges());
}

#[tokio::test]
async fn test_data_response_reads_from_offset() {
    let mut response = HttpResponse::data("0123456789");
    response.set_offset(4).await.unwrap();

    assert_eq!(&response.read_data(3).await.unwrap()[..], b"456");
    assert_eq!(&response.read_data(100).await.unwrap()[..], b"789");
    assert!(response.is_done());
    assert!(response.read_data(10).await.unwrap().is_empty());
}

#[test]
fn test_redirect_response() {
    let response = HttpResponse::Redirect(RedirectResponse::temporary("/elsewhere"));
    assert_eq!(response.status(), StatusCode::TemporaryRedirect);
    assert_eq!(response.content_length(), Some(0));

    let mut expected = HeaderMap::new();
    expected.set("Location", "/elsewhere");
    assert_eq!(response.headers(), expected);

    let permanent = RedirectResponse::permanent("/docs/");
    assert_eq!(permanent.status(), StatusCode::MovedPermanently);
}

#[tokio::test]
async fn test_chunked_response_drains_channel() {
    let (tx, chunked) = ChunkedResponse::channel(4);
    let mut response = HttpResponse::Chunked(chunked.with_content_type("text/plain"));

    assert!(response.is_chunked());
    assert!(response.is_async());
    assert_eq!(response.content_length(), None);

    tx.send(bytes::Bytes::from_static(b"hello ")).await.unwrap();
    tx.send(bytes::Bytes::from_static(b"world")).await.unwrap();
    drop(tx);

    let mut body = Vec::new();
    loop {
        let data = response.read_data(4).await.unwrap();
        if data.is_empty() {
            break;
        }
        assert!(data.len() <= 4);
        body.extend_from_slice(&data);
    }
    assert_eq!(body, b"hello world");
    assert!(response.is_done());
}
