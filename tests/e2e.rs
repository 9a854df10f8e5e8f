//! End-to-end HTTP/1.1 scenarios over real sockets.

mod helpers;

use std::convert::Infallible;
use std::time::{Duration, Instant};

use loach::error::{ErrorResponse, StreamError};
use loach::http::StatusCode;
use loach::{
    Body, BodyChunk, Middleware, Request, RespondContext, Responder, Response, ServerConf,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use helpers::client::read_response;
use helpers::{run, start_server};

struct Hello;

impl Responder for Hello {
    type Error = Infallible;

    async fn respond(&self, _req: Request, _cx: &RespondContext) -> Result<Response, Self::Error> {
        Ok(Response::with_body("Hello"))
    }
}

/// Replies with the request path, for telling responses apart.
struct PathEcho;

impl Responder for PathEcho {
    type Error = Infallible;

    async fn respond(&self, req: Request, _cx: &RespondContext) -> Result<Response, Self::Error> {
        Ok(Response::with_body(req.head.uri.path().to_string()))
    }
}

/// Streams the request body straight back out.
struct Echo;

impl Responder for Echo {
    type Error = Infallible;

    async fn respond(&self, req: Request, _cx: &RespondContext) -> Result<Response, Self::Error> {
        let (response, tx) = Response::streamed();
        let mut body = req.body;
        tokio::task::spawn_local(async move {
            loop {
                match body.next_chunk().await {
                    Ok(BodyChunk::Chunk(chunk)) => {
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Ok(BodyChunk::Done) => break,
                    Err(_) => {
                        tx.abort().await;
                        break;
                    }
                }
            }
        });
        Ok(response)
    }
}

/// Buffers the whole request body; replies 413 when the stream reports
/// the upload ceiling was hit.
struct Collect;

impl Responder for Collect {
    type Error = ErrorResponse;

    async fn respond(&self, req: Request, _cx: &RespondContext) -> Result<Response, Self::Error> {
        let mut body = req.body;
        match body.collect().await {
            Ok(bytes) => Ok(Response::with_body(bytes)),
            Err(StreamError::PayloadTooLarge { .. }) => Err(ErrorResponse::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload too large",
            )),
            Err(e) => Err(ErrorResponse::new(
                StatusCode::BAD_REQUEST,
                format!("bad request body: {e}"),
            )),
        }
    }
}

struct Slow(Duration);

impl Responder for Slow {
    type Error = Infallible;

    async fn respond(&self, _req: Request, _cx: &RespondContext) -> Result<Response, Self::Error> {
        tokio::time::sleep(self.0).await;
        Ok(Response::with_body("slow and steady"))
    }
}

fn body_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn get_hello() {
    run(async {
        let (server, addr) = start_server(ServerConf::default(), Hello).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nhost: x\r\n\r\n")
            .await
            .unwrap();
        let (rd, _wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        let response = read_response(&mut rd).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-length"), Some("5"));
        assert_eq!(response.body, b"Hello");

        server.stop().await;
    });
}

#[test]
fn server_header_emitted_when_configured() {
    run(async {
        let conf = ServerConf {
            server_name: Some("loach-test".into()),
            ..Default::default()
        };
        let (server, addr) = start_server(conf, Hello).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nhost: x\r\n\r\n")
            .await
            .unwrap();
        let (rd, _wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        let response = read_response(&mut rd).await.unwrap();
        assert_eq!(response.header("server"), Some("loach-test"));

        server.stop().await;
    });
}

#[test]
fn pipelined_requests_answered_in_order() {
    run(async {
        let (server, addr) = start_server(ServerConf::default(), PathEcho).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /a HTTP/1.1\r\nhost: x\r\n\r\nGET /b HTTP/1.1\r\nhost: x\r\n\r\n")
            .await
            .unwrap();
        let (rd, _wr) = stream.into_split();
        let mut rd = BufReader::new(rd);

        let first = read_response(&mut rd).await.unwrap();
        let second = read_response(&mut rd).await.unwrap();
        assert_eq!(first.body, b"/a");
        assert_eq!(second.body, b"/b");

        server.stop().await;
    });
}

#[test]
fn keep_alive_reuses_the_connection() {
    run(async {
        let (server, addr) = start_server(ServerConf::default(), PathEcho).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);

        for path in ["/one", "/two", "/three"] {
            wr.write_all(format!("GET {path} HTTP/1.1\r\nhost: x\r\n\r\n").as_bytes())
                .await
                .unwrap();
            let response = read_response(&mut rd).await.unwrap();
            assert_eq!(response.status, 200);
            assert_eq!(response.body, path.as_bytes());
            assert_eq!(response.header("connection"), Some("keep-alive"));
        }

        server.stop().await;
    });
}

#[test]
fn connection_close_is_honored() {
    run(async {
        let (server, addr) = start_server(ServerConf::default(), Hello).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nhost: x\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        let (rd, _wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        let response = read_response(&mut rd).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("connection"), Some("close"));

        // the server hangs up after the response
        let mut rest = Vec::new();
        rd.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        server.stop().await;
    });
}

#[test]
fn large_post_streams_back() {
    run(async {
        let conf = ServerConf {
            max_streaming_buffer_size: 64 * 1024,
            max_upload_size: 4 * 1024 * 1024,
            ..Default::default()
        };
        let (server, addr) = start_server(conf, Echo).await;

        let body = body_pattern(1024 * 1024);
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rd, mut wr) = stream.into_split();

        let expected = body.clone();
        let writer = tokio::task::spawn_local(async move {
            wr.write_all(
                format!(
                    "POST /up HTTP/1.1\r\nhost: x\r\ncontent-length: {}\r\n\r\n",
                    body.len()
                )
                .as_bytes(),
            )
            .await
            .unwrap();
            for chunk in body.chunks(32 * 1024) {
                wr.write_all(chunk).await.unwrap();
            }
        });

        let mut rd = BufReader::new(rd);
        let response = read_response(&mut rd).await.unwrap();
        writer.await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.header("transfer-encoding"), Some("chunked"));
        assert_eq!(response.body.len(), expected.len());
        assert_eq!(response.body, expected);

        server.stop().await;
    });
}

#[test]
fn echo_survives_a_tiny_streaming_buffer() {
    run(async {
        let conf = ServerConf {
            max_streaming_buffer_size: 4 * 1024,
            max_upload_size: 4 * 1024 * 1024,
            ..Default::default()
        };
        let (server, addr) = start_server(conf, Echo).await;

        let body = body_pattern(256 * 1024);
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rd, mut wr) = stream.into_split();

        let expected = body.clone();
        let writer = tokio::task::spawn_local(async move {
            wr.write_all(
                format!(
                    "POST /up HTTP/1.1\r\nhost: x\r\ncontent-length: {}\r\n\r\n",
                    body.len()
                )
                .as_bytes(),
            )
            .await
            .unwrap();
            for chunk in body.chunks(8 * 1024) {
                wr.write_all(chunk).await.unwrap();
            }
        });

        let mut rd = BufReader::new(rd);
        let response = read_response(&mut rd).await.unwrap();
        writer.await.unwrap();

        assert_eq!(response.body, expected);

        server.stop().await;
    });
}

#[test]
fn oversized_post_gets_413_then_close() {
    run(async {
        let conf = ServerConf {
            max_upload_size: 64 * 1024,
            max_streaming_buffer_size: 16 * 1024,
            ..Default::default()
        };
        let (server, addr) = start_server(conf, Collect).await;

        // twice the ceiling
        let body = vec![0u8; 128 * 1024];
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rd, mut wr) = stream.into_split();

        let writer = tokio::task::spawn_local(async move {
            let head = format!(
                "POST /up HTTP/1.1\r\nhost: x\r\ncontent-length: {}\r\n\r\n",
                body.len()
            );
            // the server may slam the door mid-upload; that's the point
            let _ = wr.write_all(head.as_bytes()).await;
            for chunk in body.chunks(16 * 1024) {
                if wr.write_all(chunk).await.is_err() {
                    break;
                }
            }
        });

        let mut rd = BufReader::new(rd);
        let response = read_response(&mut rd).await.unwrap();
        assert_eq!(response.status, 413);

        // after the response the transport closes
        let mut rest = Vec::new();
        let _ = rd.read_to_end(&mut rest).await;
        assert!(rest.is_empty());

        writer.await.unwrap();
        server.stop().await;
    });
}

#[test]
fn malformed_request_gets_400() {
    run(async {
        let (server, addr) = start_server(ServerConf::default(), Hello).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"\x16\x03\x01 this is not http\r\n\r\n")
            .await
            .unwrap();
        let (rd, _wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        let response = read_response(&mut rd).await.unwrap();
        assert_eq!(response.status, 400);

        server.stop().await;
    });
}

#[test]
fn graceful_shutdown_finishes_in_flight_request() {
    run(async {
        let (server, addr) = start_server(ServerConf::default(), Slow(Duration::from_millis(400)))
            .await;

        let client = tokio::task::spawn_local(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /slow HTTP/1.1\r\nhost: x\r\n\r\n")
                .await
                .unwrap();
            let (rd, _wr) = stream.into_split();
            let mut rd = BufReader::new(rd);
            read_response(&mut rd).await.unwrap()
        });

        // let the request reach the responder, then pull the plug
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stopping = Instant::now();
        // stopping twice concurrently resolves both callers
        tokio::join!(server.stop(), server.stop());
        let stop_took = stopping.elapsed();

        // stop() had to wait out the in-flight response
        assert!(
            stop_took >= Duration::from_millis(200),
            "stop resolved too early: {stop_took:?}"
        );

        let response = client.await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"slow and steady");

        // the listener is gone
        assert!(TcpStream::connect(addr).await.is_err());
    });
}

/// Counts requests per connection; proves middleware instances are fresh
/// per connection and applied in order.
struct CountingMiddleware {
    seen: u32,
}

impl Middleware for CountingMiddleware {
    fn on_request(&mut self, _req: &mut Request) {
        self.seen += 1;
    }

    fn on_response(&mut self, res: &mut Response) {
        res.headers.insert(
            "x-requests-on-connection",
            self.seen.to_string().parse().unwrap(),
        );
    }
}

#[test]
fn middleware_is_fresh_per_connection() {
    run(async {
        let server = loach::Server::new(ServerConf::default());
        server.add_middleware(|| CountingMiddleware { seen: 0 });
        server.start(Hello).await.unwrap();
        let addr = server.local_addr().unwrap();

        // two requests on one connection: the counter advances
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        for expected in ["1", "2"] {
            wr.write_all(b"GET / HTTP/1.1\r\nhost: x\r\n\r\n")
                .await
                .unwrap();
            let response = read_response(&mut rd).await.unwrap();
            assert_eq!(response.header("x-requests-on-connection"), Some(expected));
        }

        // a new connection starts over
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nhost: x\r\n\r\n")
            .await
            .unwrap();
        let (rd, _wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        let response = read_response(&mut rd).await.unwrap();
        assert_eq!(response.header("x-requests-on-connection"), Some("1"));

        server.stop().await;
    });
}

#[cfg(unix)]
#[test]
fn serves_over_unix_domain_sockets() {
    use loach::BindAddr;
    use tokio::net::UnixStream;

    run(async {
        let path = std::env::temp_dir().join(format!("loach-test-{}.sock", std::process::id()));
        let conf = ServerConf {
            address: BindAddr::Unix { path: path.clone() },
            ..Default::default()
        };
        let server = loach::Server::new(conf);
        server.start(Hello).await.unwrap();
        assert_eq!(server.port(), None);

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nhost: x\r\n\r\n")
            .await
            .unwrap();
        let (rd, _wr) = stream.into_split();
        let mut rd = BufReader::new(rd);
        let response = read_response(&mut rd).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"Hello");

        server.stop().await;
        let _ = std::fs::remove_file(&path);
    });
}

#[test]
fn idle_read_timeout_reaps_quiet_connections() {
    run(async {
        let conf = ServerConf {
            h1_idle_timeout: Some(loach::IdleTimeout {
                read: Duration::from_millis(150),
                write: Duration::from_millis(150),
            }),
            ..Default::default()
        };
        let (server, addr) = start_server(conf, Hello).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        // send nothing; the server should hang up on its own
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
            .await
            .expect("server reaped the idle connection")
            .unwrap();
        assert_eq!(n, 0);

        server.stop().await;
    });
}
