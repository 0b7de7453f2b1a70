//! End-to-end gateway tests over real sockets.
//!
//! The gateway app is served on an ephemeral loopback port with plain HTTP
//! (certificate provisioning has its own tests against a mock authority);
//! requests are written raw so the Host header, and therefore the dispatch
//! decision, is fully controlled. The reverse-proxy tests stand up real
//! upstream listeners, including one that accepts connection upgrades.

use std::net::SocketAddr;
use std::path::Path;

use axum::body::Bytes;
use axum::http::{header, StatusCode};
use axum::routing::get;
use axum::Router;
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use hostgate::access_log::AccessLog;
use hostgate::config::{
    AppConfig, HandlerConfig, HostConfig, HttpServerConfig, LoggingConfig, TlsConfig,
};
use hostgate::Gateway;

fn test_config(hosts: Vec<HostConfig>) -> AppConfig {
    let allow_hosts = hosts.iter().map(|h| h.hostname.clone()).collect();
    AppConfig {
        http: HttpServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            https_port: 8443,
        },
        tls: TlsConfig {
            cache_dir: "certs".to_string(),
            contact_email: "admin@example.com".to_string(),
            allow_hosts,
            renew_before_days: 30,
            production: false,
        },
        hosts,
        logging: LoggingConfig::default(),
    }
}

/// Serve an app on an ephemeral loopback port.
async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

/// One raw HTTP/1.1 request, response read to connection close.
async fn raw_request(addr: SocketAddr, host: &str, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request =
        format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn loads_toml_config_and_serves_static_files() {
    let www = tempfile::TempDir::new().unwrap();
    std::fs::write(www.path().join("index.html"), "<h1>hello</h1>").unwrap();
    std::fs::write(www.path().join("about.html"), "about page").unwrap();

    let config_dir = tempfile::TempDir::new().unwrap();
    let config_path = config_dir.path().join("gateway.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
[http]
bind = "127.0.0.1"

[tls]
contact_email = "admin@example.com"
allow_hosts = ["example.com"]

[[host]]
hostname = "example.com"
handler = {{ type = "static", root = "{}" }}
"#,
            www.path().display()
        ),
    )
    .unwrap();

    let config = AppConfig::load(&config_path).unwrap();
    let gateway = Gateway::from_config(config).unwrap();
    let addr = serve(gateway.into_app(AccessLog::disabled())).await;

    let response = raw_request(addr, "example.com", "/about.html").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("about page"));

    // Directory request resolves to its index.
    let response = raw_request(addr, "example.com", "/").await;
    assert!(response.ends_with("<h1>hello</h1>"));

    // Same path on an unregistered hostname misses the routing table.
    let response = raw_request(addr, "other.example.com", "/about.html").await;
    assert!(response.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn proxies_requests_to_upstream() {
    let upstream = Router::new()
        .route("/data", get(|| async { "from upstream" }))
        .route(
            "/host",
            get(|headers: axum::http::HeaderMap| async move {
                headers[header::HOST].to_str().unwrap().to_string()
            }),
        )
        .route(
            "/inspect",
            get(|headers: axum::http::HeaderMap| async move {
                format!(
                    "x-drop-me={} x-forwarded-for={}",
                    headers.contains_key("x-drop-me"),
                    headers
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-"),
                )
            }),
        );
    let upstream_addr = serve(upstream).await;

    let gateway = Gateway::from_config(test_config(vec![HostConfig {
        hostname: "ws.example.com".to_string(),
        handler: HandlerConfig::Proxy {
            upstream: format!("http://{upstream_addr}"),
        },
    }]))
    .unwrap();
    let addr = serve(gateway.into_app(AccessLog::disabled())).await;

    let response = raw_request(addr, "ws.example.com", "/data").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("from upstream"));

    // The Host header is rewritten to the upstream authority.
    let response = raw_request(addr, "ws.example.com", "/host").await;
    assert!(response.ends_with(&upstream_addr.to_string()));

    // Headers named in Connection stay on this hop; the client address is
    // recorded in X-Forwarded-For.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /inspect HTTP/1.1\r\n\
              Host: ws.example.com\r\n\
              X-Drop-Me: 1\r\n\
              Connection: close, x-drop-me\r\n\r\n",
        )
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.contains("x-drop-me=false"), "got: {response}");
    assert!(response.contains("x-forwarded-for=127.0.0.1"), "got: {response}");
}

#[tokio::test]
async fn unreachable_upstream_is_a_502_for_that_request_only() {
    // Bind and drop to get a port nothing listens on.
    let dead_addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let www = tempfile::TempDir::new().unwrap();
    std::fs::write(www.path().join("index.html"), "still up").unwrap();

    let gateway = Gateway::from_config(test_config(vec![
        HostConfig {
            hostname: "ws.example.com".to_string(),
            handler: HandlerConfig::Proxy {
                upstream: format!("http://{dead_addr}"),
            },
        },
        HostConfig {
            hostname: "example.com".to_string(),
            handler: HandlerConfig::Static {
                root: www.path().to_string_lossy().into_owned(),
            },
        },
    ]))
    .unwrap();
    let addr = serve(gateway.into_app(AccessLog::disabled())).await;

    let response = raw_request(addr, "ws.example.com", "/").await;
    assert!(response.starts_with("HTTP/1.1 502"));

    // The other hosts keep serving.
    let response = raw_request(addr, "example.com", "/").await;
    assert!(response.starts_with("HTTP/1.1 200"));
}

/// Upstream that answers every request with a 101 and then echoes raw bytes
/// on the upgraded connection.
async fn spawn_echo_upgrade_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = hyper::service::service_fn(
                    |mut req: hyper::Request<hyper::body::Incoming>| async move {
                        let on_upgrade = hyper::upgrade::on(&mut req);
                        tokio::spawn(async move {
                            let Ok(upgraded) = on_upgrade.await else {
                                return;
                            };
                            let mut io = TokioIo::new(upgraded);
                            let mut buf = [0u8; 1024];
                            loop {
                                match io.read(&mut buf).await {
                                    Ok(0) | Err(_) => return,
                                    Ok(n) => {
                                        if io.write_all(&buf[..n]).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                        });
                        Ok::<_, std::convert::Infallible>(
                            hyper::Response::builder()
                                .status(StatusCode::SWITCHING_PROTOCOLS)
                                .header(header::CONNECTION, "upgrade")
                                .header(header::UPGRADE, "echo")
                                .body(Empty::<Bytes>::new())
                                .unwrap(),
                        )
                    },
                );
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    addr
}

#[tokio::test]
async fn relays_upgraded_connections_end_to_end() {
    let upstream_addr = spawn_echo_upgrade_upstream().await;

    let gateway = Gateway::from_config(test_config(vec![HostConfig {
        hostname: "ws.example.com".to_string(),
        handler: HandlerConfig::Proxy {
            upstream: format!("http://{upstream_addr}"),
        },
    }]))
    .unwrap();
    let addr = serve(gateway.into_app(AccessLog::disabled())).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /socket HTTP/1.1\r\n\
              Host: ws.example.com\r\n\
              Connection: Upgrade\r\n\
              Upgrade: echo\r\n\r\n",
        )
        .await
        .unwrap();

    // Read the response head only; the connection stays open afterwards.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "got: {head}");

    // Past the handshake the relay is a dumb pipe in both directions.
    for payload in [&b"first frame"[..], &b"second, longer frame"[..]] {
        stream.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);
    }
}

#[tokio::test]
async fn access_log_captures_host_status_and_method() {
    let www = tempfile::TempDir::new().unwrap();
    std::fs::write(www.path().join("index.html"), "logged").unwrap();

    let log_dir = tempfile::TempDir::new().unwrap();
    let log_path = log_dir.path().join("access.log");
    let access_log = AccessLog::open(Path::new(&log_path)).await.unwrap();

    let gateway = Gateway::from_config(test_config(vec![HostConfig {
        hostname: "example.com".to_string(),
        handler: HandlerConfig::Static {
            root: www.path().to_string_lossy().into_owned(),
        },
    }]))
    .unwrap();
    let addr = serve(gateway.into_app(access_log)).await;

    let response = raw_request(addr, "example.com", "/index.html").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    let response = raw_request(addr, "missing.example.com", "/").await;
    assert!(response.starts_with("HTTP/1.1 404"));

    // The writer task is asynchronous; poll until both lines land.
    let mut contents = String::new();
    for _ in 0..50 {
        contents = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
        if contents.lines().count() == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("GET /index.html example.com 200"));
    assert!(lines[1].contains("GET / missing.example.com 404"));
}
