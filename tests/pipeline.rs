//! End-to-end tests of the request pipeline over real sockets.

use std::io;
use std::time::Duration;

use app_server::health;
use app_server::http::{ByteLimit, RequestContext, Route, ServerOptions};
use app_server::observability::field;
use axum::body::Bytes;
use axum::http::StatusCode;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::Level;

mod common;

fn routes() -> Vec<Route> {
    let mut routes = health::routes();
    routes.push(Route::get("/trace", |ctx: RequestContext| async move {
        ctx.trace_id().to_string()
    }));
    routes.push(Route::get("/ok", || async { "ok" }));
    routes.push(Route::get("/order", |ctx: RequestContext| async move {
        ctx.info("order loaded", &[field("order", 42)]);
        "loaded"
    }));
    routes.push(Route::get("/panic", || async {
        if true {
            panic!("handler blew up");
        }
        "unreachable"
    }));
    routes.push(Route::get("/pipe", || async {
        if true {
            std::panic::panic_any(io::Error::new(io::ErrorKind::BrokenPipe, "write: broken pipe"));
        }
        "unreachable"
    }));
    routes.push(Route::post("/upload", |body: Bytes| async move {
        body.len().to_string()
    }));
    routes.push(Route::get("/flaky", |ctx: RequestContext| async move {
        ctx.record_error("upstream unavailable");
        (StatusCode::BAD_GATEWAY, "bad gateway")
    }));
    routes.push(Route::get("/slow", || async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        "late"
    }));
    routes
}

#[tokio::test]
async fn test_health_route() {
    let running = common::start(ServerOptions::new(), routes()).await;

    let res = common::client()
        .get(running.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), r#"{"message":"success"}"#);

    running.stop().await;
}

#[tokio::test]
async fn test_inbound_trace_id_is_echoed() {
    let running = common::start(ServerOptions::new(), routes()).await;

    let res = common::client()
        .get(running.url("/trace"))
        .header("x-trace-id", "trace-abc-123")
        .send()
        .await
        .unwrap();
    assert_eq!(res.headers()["x-trace-id"], "trace-abc-123");
    assert_eq!(res.text().await.unwrap(), "trace-abc-123");

    let res = common::client()
        .get(running.url("/trace"))
        .header(
            "traceparent",
            "00-0AF7651916CD43DD8448EB211C80319C-b7ad6b7169203331-01",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(res.headers()["x-trace-id"], "0af7651916cd43dd8448eb211c80319c");

    running.stop().await;
}

#[tokio::test]
async fn test_generated_trace_ids_are_unique() {
    let running = common::start(ServerOptions::new(), routes()).await;
    let client = common::client();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..20 {
        let res = client.get(running.url("/trace")).send().await.unwrap();
        let id = res.headers()["x-trace-id"].to_str().unwrap().to_string();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(seen.insert(id), "trace ids must not repeat");
    }

    running.stop().await;
}

#[tokio::test]
async fn test_panic_returns_500_and_connection_survives() {
    let running = common::start(ServerOptions::new(), routes()).await;
    let mut stream = TcpStream::connect(running.addr).await.unwrap();

    common::send_raw(
        &mut stream,
        &common::get_request("/panic", &[("Authorization", "Bearer top-secret")]),
    )
    .await;
    let first = common::read_response(&mut stream).await.expect("500 response");
    assert_eq!(first.status, 500);

    // Same connection, next request.
    common::send_raw(&mut stream, &common::get_request("/ok", &[])).await;
    let second = common::read_response(&mut stream).await.expect("200 response");
    assert_eq!(second.status, 200);
    assert_eq!(second.body, b"ok");

    let errors = running.logger.at_level(Level::ERROR);
    assert_eq!(errors.len(), 1, "exactly one error record: {errors:?}");
    let record = &errors[0];
    assert_eq!(record.message, "[Recovery from panic]");
    assert_eq!(record.field_str("error"), Some("handler blew up"));

    let dump = record.field_str("request").unwrap();
    assert!(dump.contains("authorization: [REDACTED]"));
    assert!(!dump.contains("top-secret"));
    assert_eq!(
        record.meta.as_ref().map(|m| m.path.as_str()),
        Some("/panic")
    );

    running.stop().await;
}

#[tokio::test]
async fn test_sensitive_dump_when_allowed() {
    let running = common::start(ServerOptions::new().with_sensitive_dump(true), routes()).await;

    let res = common::client()
        .get(running.url("/panic"))
        .header("authorization", "Bearer visible")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 500);

    let record = &running.logger.at_level(Level::ERROR)[0];
    assert!(record
        .field_str("request")
        .unwrap()
        .contains("authorization: Bearer visible"));

    running.stop().await;
}

#[tokio::test]
async fn test_broken_pipe_closes_without_response() {
    let running = common::start(ServerOptions::new(), routes()).await;
    let mut stream = TcpStream::connect(running.addr).await.unwrap();

    common::send_raw(&mut stream, &common::get_request("/pipe", &[])).await;

    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
        .await
        .expect("connection closed promptly");
    match read {
        Ok(_) => assert!(buf.is_empty(), "no response bytes expected, got {buf:?}"),
        Err(err) => assert_eq!(err.kind(), io::ErrorKind::ConnectionReset),
    }

    let errors = running.logger.at_level(Level::ERROR);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "/pipe");
    assert_eq!(errors[0].field_str("error"), Some("write: broken pipe"));

    // The access log carries the recorded error.
    let access: Vec<_> = running
        .logger
        .at_level(Level::INFO)
        .into_iter()
        .filter(|r| r.message == "/pipe")
        .collect();
    assert_eq!(access.len(), 1);
    assert!(access[0]
        .field_str("errors")
        .unwrap()
        .contains("Error #01: write: broken pipe"));

    running.stop().await;
}

#[tokio::test]
async fn test_body_limit_boundary() {
    let options = ServerOptions::new().with_max_body_bytes(ByteLimit::Bytes(16));
    let running = common::start(options, routes()).await;
    let client = common::client();

    let res = client
        .post(running.url("/upload"))
        .body(vec![b'a'; 16])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "16");

    let res = client
        .post(running.url("/upload"))
        .body(vec![b'a'; 17])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE.as_u16());

    running.stop().await;
}

#[tokio::test]
async fn test_access_log_records_request_errors() {
    let running = common::start(ServerOptions::new(), routes()).await;

    let res = common::client()
        .get(running.url("/flaky?attempt=2"))
        .header("user-agent", "it/1.0")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 502);

    let records: Vec<_> = running
        .logger
        .at_level(Level::INFO)
        .into_iter()
        .filter(|r| r.message == "/flaky")
        .collect();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.field("status"), Some(&serde_json::Value::from(502)));
    assert_eq!(record.field_str("query"), Some("attempt=2"));
    assert_eq!(record.field_str("user-agent"), Some("it/1.0"));
    assert_eq!(record.field_str("ip"), Some("127.0.0.1"));
    assert_eq!(
        record.field_str("errors"),
        Some("Error #01: upstream unavailable\n")
    );

    running.stop().await;
}

#[tokio::test]
async fn test_write_timeout_returns_408() {
    let options = ServerOptions::new().with_write_timeout(Duration::from_millis(100));
    let running = common::start(options, routes()).await;

    let res = common::client()
        .get(running.url("/slow"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 408);
    assert!(res.headers().contains_key("x-trace-id"));

    running.stop().await;
}

#[tokio::test]
async fn test_handler_logs_carry_trace_id() {
    let running = common::start(ServerOptions::new(), routes()).await;

    let res = common::client()
        .get(running.url("/order"))
        .send()
        .await
        .unwrap();
    let echoed = res.headers()["x-trace-id"].to_str().unwrap().to_string();

    let records: Vec<_> = running
        .logger
        .at_level(Level::INFO)
        .into_iter()
        .filter(|r| r.message == "order loaded")
        .collect();
    assert_eq!(records.len(), 1);
    let meta = records[0].meta.as_ref().expect("request meta attached");
    assert_eq!(meta.trace_id, echoed);
    assert_eq!(meta.path, "/order");
    assert_eq!(records[0].field("order"), Some(&serde_json::Value::from(42)));

    running.stop().await;
}

#[tokio::test]
async fn test_zero_keep_alive_closes_after_each_response() {
    let options = ServerOptions::new().with_keep_alive_timeout(Duration::ZERO);
    let running = common::start(options, routes()).await;
    let mut stream = TcpStream::connect(running.addr).await.unwrap();

    common::send_raw(&mut stream, &common::get_request("/ok", &[])).await;
    let res = common::read_response(&mut stream).await.expect("200 response");
    assert_eq!(res.status, 200);
    assert!(res.head.to_ascii_lowercase().contains("connection: close"));

    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest))
        .await
        .expect("server closes the connection");
    assert_eq!(read.unwrap(), 0);

    running.stop().await;
}

#[tokio::test]
async fn test_oversized_headers_are_rejected() {
    let options = ServerOptions::new().with_max_header_bytes(ByteLimit::Bytes(16 * 1024));
    let running = common::start(options, routes()).await;
    let mut stream = TcpStream::connect(running.addr).await.unwrap();

    let big = "a".repeat(40 * 1024);
    common::send_raw(&mut stream, &common::get_request("/ok", &[("x-big", &big)])).await;
    let res = common::read_response(&mut stream).await.expect("error response");
    assert_eq!(res.status, StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE.as_u16());

    // Headers under the limit still work.
    let mut stream = TcpStream::connect(running.addr).await.unwrap();
    let small = "a".repeat(1024);
    common::send_raw(&mut stream, &common::get_request("/ok", &[("x-small", &small)])).await;
    let res = common::read_response(&mut stream).await.expect("200 response");
    assert_eq!(res.status, 200);

    running.stop().await;
}

#[tokio::test]
async fn test_read_timeout_drops_stalled_request_head() {
    let options = ServerOptions::new().with_read_timeout(Duration::from_millis(200));
    let running = common::start(options, routes()).await;
    let mut stream = TcpStream::connect(running.addr).await.unwrap();

    // Request line only; the head never completes.
    common::send_raw(&mut stream, "GET /ok HTTP/1.1\r\nHost: localhost\r\n").await;

    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut buf))
        .await
        .expect("server gives up on the stalled head");
    if read.is_ok() && !buf.is_empty() {
        let head = String::from_utf8_lossy(&buf);
        assert!(head.starts_with("HTTP/1.1 408"), "unexpected response: {head}");
    }
    assert!(!String::from_utf8_lossy(&buf).contains("200 OK"));

    running.stop().await;
}
