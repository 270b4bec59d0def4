use tuplegate::http::request::{Method, Request, RequestBuilder, Version};

fn get(version: Version, connection: Option<&str>) -> Request {
    let mut builder = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .version(version);
    if let Some(value) = connection {
        builder = builder.header("Connection", value);
    }
    builder.build().unwrap()
}

#[test]
fn test_request_header_retrieval() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .path("/")
        .header("Host", "example.com")
        .header("Content-Type", "application/json")
        .build()
        .unwrap();

    assert_eq!(req.header("Host"), Some("example.com"));
    assert_eq!(req.header("content-type"), Some("application/json"));
    assert_eq!(req.header("Missing"), None);
}

#[test]
fn test_request_content_length_parsing() {
    let req = RequestBuilder::new()
        .method(Method::POST)
        .path("/api")
        .header("Content-Length", "42")
        .build()
        .unwrap();

    assert_eq!(req.content_length(), 42);
}

#[test]
fn test_request_content_length_invalid() {
    let req = RequestBuilder::new()
        .method(Method::POST)
        .path("/api")
        .header("Content-Length", "not-a-number")
        .build()
        .unwrap();

    assert_eq!(req.content_length(), 0);
}

#[test]
fn test_request_builder_requires_method_and_path() {
    assert!(RequestBuilder::new().path("/").build().is_err());
    assert!(RequestBuilder::new().method(Method::GET).build().is_err());
}

#[test]
fn test_request_keep_alive_http11_default() {
    assert!(get(Version::Http11, None).keep_alive());
}

#[test]
fn test_request_keep_alive_http10_default() {
    assert!(!get(Version::Http10, None).keep_alive());
    assert!(!get(Version::Http09, None).keep_alive());
}

#[test]
fn test_request_keep_alive_explicit_header() {
    assert!(get(Version::Http10, Some("keep-alive")).keep_alive());
}

#[test]
fn test_request_keep_alive_close() {
    assert!(!get(Version::Http11, Some("close")).keep_alive());
}

#[test]
fn test_request_close_wins_over_keep_alive() {
    assert!(!get(Version::Http11, Some("keep-alive, close")).keep_alive());
}

#[test]
fn test_request_keep_alive_case_insensitive() {
    assert!(get(Version::Http10, Some("Keep-Alive")).keep_alive());
}

#[test]
fn test_request_method_from_string() {
    assert_eq!(Method::from_str("GET"), Some(Method::GET));
    assert_eq!(Method::from_str("POST"), Some(Method::POST));
    assert_eq!(Method::from_str("INVALID"), None);
    assert_eq!(Method::from_str("get"), None); // Case-sensitive
}

#[test]
fn test_request_supported_methods() {
    assert!(Method::GET.is_supported());
    assert!(Method::HEAD.is_supported());
    assert!(!Method::POST.is_supported());
    assert!(!Method::DELETE.is_supported());
}

#[test]
fn test_request_target_path_strips_query() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .path("/docs/a.html?v=2#top")
        .build()
        .unwrap();

    assert_eq!(req.target_path().as_deref(), Some("/docs/a.html"));
}

#[test]
fn test_request_target_path_absolute_form() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .path("http://example.com/docs/a.html")
        .build()
        .unwrap();

    assert_eq!(req.target_path().as_deref(), Some("/docs/a.html"));
}

#[test]
fn test_request_target_path_resolves_dot_segments() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .path("/docs/../../etc/passwd")
        .build()
        .unwrap();

    assert_eq!(req.target_path().as_deref(), Some("/etc/passwd"));
}

#[test]
fn test_request_target_path_rejects_other_schemes() {
    let req = RequestBuilder::new()
        .method(Method::GET)
        .path("ftp://example.com/file")
        .build()
        .unwrap();

    assert_eq!(req.target_path(), None);
}

#[test]
fn test_request_target_path_is_percent_decoded() {
    let path = |target: &str| {
        RequestBuilder::new()
            .method(Method::GET)
            .path(target)
            .build()
            .unwrap()
            .target_path()
    };

    assert_eq!(path("/a%20b.txt").as_deref(), Some("/a b.txt"));
    assert_eq!(path("/d%C3%A9j%C3%A0/vu.txt").as_deref(), Some("/déjà/vu.txt"));
    assert_eq!(path("/docs/%2e%2e/a.txt").as_deref(), Some("/a.txt"));
}

#[test]
fn test_request_target_path_rejects_encoded_separators() {
    let path = |target: &str| {
        RequestBuilder::new()
            .method(Method::GET)
            .path(target)
            .build()
            .unwrap()
            .target_path()
    };

    assert_eq!(path("/docs%2Fa.txt"), None);
    assert_eq!(path("/a%00.txt"), None);
    assert_eq!(path("/bad%FF.txt"), None);
}

#[test]
fn test_request_with_body() {
    let body_content = b"test body content".to_vec();
    let req = RequestBuilder::new()
        .method(Method::POST)
        .path("/api")
        .body(body_content.clone())
        .build()
        .unwrap();

    assert_eq!(req.body, body_content);
}
