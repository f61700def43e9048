//! Transport-level tests against real sockets: phase timeouts, read limits,
//! aborts, and connection reuse.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use url::Url;

use crawl_worker::{Request, RequestOptions, Transport, TransportError};

/// Reads one request head off the stream; `None` on EOF before any byte.
async fn read_request_head(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return if buf.is_empty() { None } else { Some(String::from_utf8_lossy(&buf).into_owned()) };
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Some(String::from_utf8_lossy(&buf).into_owned());
        }
    }
}

fn get(addr: SocketAddr, path: &str) -> Request {
    Request::get(Url::parse(&format!("http://{addr}{path}")).unwrap())
}

fn options() -> RequestOptions {
    RequestOptions {
        connect_timeout: Some(Duration::from_secs(5)),
        write_timeout: Some(Duration::from_secs(5)),
        read_timeout: Some(Duration::from_secs(5)),
        read_limit: 0,
        keep_alive: Some(Duration::from_secs(60)),
    }
}

#[tokio::test]
async fn test_connect_timeout_classified_and_bounded() {
    // A listener with a full accept backlog: further SYNs are dropped, so the
    // dial stalls until the deadline instead of failing fast.
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut backlog_fillers = Vec::new();
    for _ in 0..4 {
        if let Ok(Ok(stream)) =
            tokio::time::timeout(Duration::from_millis(100), TcpStream::connect(addr)).await
        {
            backlog_fillers.push(stream);
        }
    }

    let transport = Transport::new();
    let opts = RequestOptions {
        connect_timeout: Some(Duration::from_millis(50)),
        ..options()
    };

    let started = Instant::now();
    let err = transport
        .round_trip(&get(addr, "/slow-connect"), &opts)
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "expected timeout, got: {err}");
    assert!(matches!(err, TransportError::DialTimeout(_)));
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "dial should give up at the deadline"
    );
    drop(backlog_fillers);
    drop(listener);
}

#[tokio::test]
async fn test_read_timeout_on_stalled_response() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_head(&mut stream).await;
        // Say nothing; hold the connection open.
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stream);
    });

    let transport = Transport::new();
    let opts = RequestOptions {
        read_timeout: Some(Duration::from_millis(50)),
        ..options()
    };

    let started = Instant::now();
    let err = transport
        .round_trip(&get(addr, "/slow-respond"), &opts)
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::ReadTimeout), "got: {err}");
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_read_timeout_on_trickled_body() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_head(&mut stream).await;
        let _ = stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 800\r\n\r\n")
            .await;
        // Trickle the body slower than the client's read deadline.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if stream.write_all(b"response").await.is_err() {
                break;
            }
        }
    });

    let transport = Transport::new();
    let opts = RequestOptions {
        read_timeout: Some(Duration::from_millis(50)),
        ..options()
    };

    let err = transport
        .round_trip(&get(addr, "/trickle"), &opts)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ReadTimeout), "got: {err}");
}

#[tokio::test]
async fn test_write_timeout_when_peer_stops_reading() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        // Accept and then never read: the client's send buffers fill up.
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let mut req = get(addr, "/slow-receive");
    req.method = "POST".to_string();
    req.body = vec![b'g'; 32 * 1024 * 1024];

    let transport = Transport::new();
    let opts = RequestOptions {
        write_timeout: Some(Duration::from_millis(50)),
        ..options()
    };

    let started = Instant::now();
    let err = transport.round_trip(&req, &opts).await.unwrap_err();
    assert!(matches!(err, TransportError::WriteTimeout), "got: {err}");
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_read_limit_truncates_silently() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_head(&mut stream).await;
        let body = "x".repeat(800);
        let _ = stream
            .write_all(
                format!("HTTP/1.1 200 OK\r\nContent-Length: 800\r\n\r\n{body}").as_bytes(),
            )
            .await;
    });

    let transport = Transport::new();
    let opts = RequestOptions {
        read_limit: 100,
        ..options()
    };

    let response = transport
        .round_trip(&get(addr, "/big"), &opts)
        .await
        .expect("truncation must not be an error");
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body.len(), 100);
    // A truncated body leaves unread bytes on the wire; the connection must
    // not be pooled.
    assert_eq!(transport.idle_count(), 0);
}

#[tokio::test]
async fn test_aborted_round_trip_then_fresh_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                while read_request_head(&mut stream).await.is_some() {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    let body = "Everything is fine.";
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
                        body.len()
                    );
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let transport = Transport::new();

    // Abort the first round-trip mid-read by dropping it at an outer deadline.
    let aborted = tokio::time::timeout(
        Duration::from_millis(5),
        transport.round_trip(&get(addr, "/delay"), &options()),
    )
    .await;
    assert!(aborted.is_err(), "expected the outer deadline to fire");

    // The transport must still serve fresh requests to the same origin.
    let response = transport
        .round_trip(&get(addr, "/delay"), &options())
        .await
        .expect("second request should succeed");
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, b"Everything is fine.");
}

#[tokio::test]
async fn test_keep_alive_reuses_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while read_request_head(&mut stream).await.is_some() {
            let response = "HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
            if stream.write_all(response.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let transport = Transport::new();

    let first = transport
        .round_trip(&get(addr, "/one"), &options())
        .await
        .unwrap();
    assert_eq!(first.stat.connection_use, 1);
    assert_eq!(transport.idle_count(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = transport
        .round_trip(&get(addr, "/two"), &options())
        .await
        .unwrap();
    assert_eq!(second.status_code, 200);
    assert_eq!(second.stat.connection_use, 2);
    assert!(second.stat.connection_age > Duration::ZERO);
    // A reused connection did not pay for a dial.
    assert_eq!(second.stat.timings.connect, Duration::ZERO);
}

#[tokio::test]
async fn test_connection_close_is_not_pooled() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_head(&mut stream).await;
        let response = "HTTP/1.0 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok";
        let _ = stream.write_all(response.as_bytes()).await;
    });

    let transport = Transport::new();
    let response = transport
        .round_trip(&get(addr, "/once"), &options())
        .await
        .unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, b"ok");
    assert_eq!(transport.idle_count(), 0);
}

#[tokio::test]
async fn test_chunked_body_is_decoded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_head(&mut stream).await;
        let response = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                        5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n";
        let _ = stream.write_all(response.as_bytes()).await;
        // Keep the connection open so EOF is not what ends the body.
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let transport = Transport::new();
    let response = transport
        .round_trip(&get(addr, "/chunked"), &options())
        .await
        .unwrap();
    assert_eq!(response.body, b"hello, world");
    // Chunked framing reached its terminal chunk: the connection is reusable.
    assert_eq!(transport.idle_count(), 1);
}

#[tokio::test]
async fn test_expired_idle_connection_is_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                while read_request_head(&mut stream).await.is_some() {
                    let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let transport = Transport::new();
    let opts = RequestOptions {
        keep_alive: Some(Duration::from_millis(30)),
        ..options()
    };

    transport.round_trip(&get(addr, "/a"), &opts).await.unwrap();
    assert_eq!(transport.idle_count(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    transport.sweep_idle();
    assert_eq!(transport.idle_count(), 0);

    // Past-TTL reuse would also have been refused without the sweep; a new
    // round-trip dials fresh.
    let response = transport.round_trip(&get(addr, "/b"), &opts).await.unwrap();
    assert_eq!(response.stat.connection_use, 1);
}

#[tokio::test]
async fn test_protocol_error_on_garbage() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request_head(&mut stream).await;
        let _ = stream.write_all(b"SMTP READY\r\n\r\n").await;
    });

    let transport = Transport::new();
    let err = transport
        .round_trip(&get(addr, "/"), &options())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Protocol(_)), "got: {err}");
    assert!(!err.is_timeout());
}
