use base64::Engine;
use beacon::http::auth::{
    AuthError, Credentials, DigestCredentials, NonceTracker, authenticate, basic_challenge,
    digest_challenge,
};
use beacon::http::message::Message;
use beacon::http::request::{HTTP_1_1, Method};

fn password_for(user: &str) -> Option<String> {
    (user == "Mufasa").then(|| "Circle Of Life".to_string())
}

fn rfc2617_credentials() -> DigestCredentials {
    DigestCredentials {
        username: "Mufasa".into(),
        realm: "testrealm@host.com".into(),
        nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".into(),
        uri: "/dir/index.html".into(),
        qop: "auth".into(),
        nc: "00000001".into(),
        cnonce: "0a4f113b".into(),
        response: "6629fae49393a05397450978507c4ef1".into(),
    }
}

fn digest_header(c: &DigestCredentials) -> String {
    format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", qop={}, nc={}, cnonce=\"{}\", response=\"{}\"",
        c.username, c.realm, c.nonce, c.uri, c.qop, c.nc, c.cnonce, c.response
    )
}

fn get(url: &str, authorization: Option<&str>) -> Message {
    let mut msg = Message::request(Method::GET, url, HTTP_1_1);
    if let Some(value) = authorization {
        msg.set_header_field("Authorization", value);
    }
    msg
}

#[test]
fn test_rfc2617_reference_response() {
    let c = rfc2617_credentials();
    assert_eq!(
        c.expected_response("Circle Of Life", "GET"),
        "6629fae49393a05397450978507c4ef1"
    );
    assert!(c.verify("Circle Of Life", "GET"));
    assert!(!c.verify("wrong", "GET"));
}

#[test]
fn test_parse_digest_header() {
    let c = rfc2617_credentials();
    let parsed = Credentials::from_header(&digest_header(&c)).unwrap();
    assert_eq!(parsed, Credentials::Digest(c));
}

#[test]
fn test_digest_missing_field() {
    let header = r#"Digest username="Mufasa", realm="r", nonce="n", uri="/", qop=auth, nc=00000001, cnonce="c""#;
    assert_eq!(
        Credentials::from_header(header),
        Err(AuthError::MissingField("response"))
    );
}

#[test]
fn test_unsupported_scheme() {
    assert_eq!(
        Credentials::from_header("Bearer abc"),
        Err(AuthError::UnsupportedScheme)
    );
}

#[test]
fn test_basic_decode() {
    let encoded = base64::engine::general_purpose::STANDARD.encode("Aladdin:open sesame");
    match Credentials::from_header(&format!("Basic {}", encoded)).unwrap() {
        Credentials::Basic(basic) => {
            assert_eq!(basic.credentials_base64, encoded);
            assert_eq!(
                basic.decode().unwrap(),
                ("Aladdin".to_string(), "open sesame".to_string())
            );
        }
        other => panic!("expected basic credentials, got {:?}", other),
    }
}

#[test]
fn test_basic_authenticate() {
    let nonces = NonceTracker::new();
    let good = base64::engine::general_purpose::STANDARD.encode("Mufasa:Circle Of Life");
    let bad = base64::engine::general_purpose::STANDARD.encode("Mufasa:nope");

    let req = get("/", Some(&format!("Basic {}", good)));
    assert_eq!(authenticate(&req, false, password_for, &nonces), Ok("Mufasa".into()));

    let req = get("/", Some(&format!("Basic {}", bad)));
    assert_eq!(
        authenticate(&req, false, password_for, &nonces),
        Err(AuthError::BadCredentials)
    );

    // Digest is required, so valid Basic credentials are not enough.
    let req = get("/", Some(&format!("Basic {}", good)));
    assert_eq!(
        authenticate(&req, true, password_for, &nonces),
        Err(AuthError::WrongScheme)
    );
}

#[test]
fn test_missing_authorization() {
    let nonces = NonceTracker::new();
    assert_eq!(
        authenticate(&get("/", None), true, password_for, &nonces),
        Err(AuthError::MissingHeader)
    );
}

#[test]
fn test_digest_authenticate_and_replay() {
    let nonces = NonceTracker::new();
    let nonce = nonces.issue();

    let mut c = rfc2617_credentials();
    c.nonce = nonce.clone();
    c.response = c.expected_response("Circle Of Life", "GET");
    let req = get("/dir/index.html", Some(&digest_header(&c)));

    assert_eq!(authenticate(&req, true, password_for, &nonces), Ok("Mufasa".into()));
    // Same nc again is a replay.
    assert_eq!(
        authenticate(&req, true, password_for, &nonces),
        Err(AuthError::Replay)
    );

    c.nc = "00000002".into();
    c.response = c.expected_response("Circle Of Life", "GET");
    let req = get("/dir/index.html", Some(&digest_header(&c)));
    assert_eq!(authenticate(&req, true, password_for, &nonces), Ok("Mufasa".into()));
}

#[test]
fn test_digest_failure_does_not_advance_counter() {
    let nonces = NonceTracker::new();
    let nonce = nonces.issue();

    let mut c = rfc2617_credentials();
    c.nonce = nonce;
    c.nc = "00000005".into();
    c.response = "00000000000000000000000000000000".into();
    let req = get("/dir/index.html", Some(&digest_header(&c)));
    assert_eq!(
        authenticate(&req, true, password_for, &nonces),
        Err(AuthError::BadCredentials)
    );

    c.nc = "00000001".into();
    c.response = c.expected_response("Circle Of Life", "GET");
    let req = get("/dir/index.html", Some(&digest_header(&c)));
    assert_eq!(authenticate(&req, true, password_for, &nonces), Ok("Mufasa".into()));
}

#[test]
fn test_digest_unknown_nonce_and_uri_mismatch() {
    let nonces = NonceTracker::new();
    let c = rfc2617_credentials();
    let req = get("/dir/index.html", Some(&digest_header(&c)));
    assert_eq!(
        authenticate(&req, true, password_for, &nonces),
        Err(AuthError::UnknownNonce)
    );

    let mut c = rfc2617_credentials();
    c.nonce = nonces.issue();
    c.response = c.expected_response("Circle Of Life", "GET");
    let req = get("/other.html", Some(&digest_header(&c)));
    assert_eq!(
        authenticate(&req, true, password_for, &nonces),
        Err(AuthError::BadCredentials)
    );
}

#[test]
fn test_unknown_user() {
    let nonces = NonceTracker::new();
    let mut c = rfc2617_credentials();
    c.username = "Scar".into();
    c.nonce = nonces.issue();
    let req = get("/dir/index.html", Some(&digest_header(&c)));
    assert_eq!(
        authenticate(&req, true, password_for, &nonces),
        Err(AuthError::UnknownUser)
    );
}

#[test]
fn test_retired_nonce_is_unknown() {
    let nonces = NonceTracker::new();
    let nonce = nonces.issue();
    assert!(nonces.is_issued(&nonce));
    nonces.retire(&nonce);
    assert!(!nonces.is_issued(&nonce));
    assert!(nonces.is_empty());
}

#[test]
fn test_challenges() {
    assert_eq!(basic_challenge("files"), "Basic realm=\"files\"");
    assert_eq!(
        digest_challenge("files", "abc"),
        "Digest realm=\"files\", qop=\"auth\", nonce=\"abc\""
    );
}
