use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use mazurka_core::{
    AuthEngine, Context, FnHooks, HttpServer, Method, Router, RunningServer, STATIC_FILE,
    ServerOptions,
};

fn start_server(ban_40x: bool) -> (RunningServer, std::net::SocketAddr, Arc<tempfile::TempDir>) {
    let dir = Arc::new(tempfile::tempdir().unwrap());
    let file_path = dir.path().join("payload.bin");
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&file_path, &payload).unwrap();

    let router = Router::new();
    router
        .rewrite(Method::Get, "/info", Method::Get, "/root/timestamp/info")
        .unwrap();
    router
        .run(
            &[Method::Get, Method::Post],
            "/user/<int:id>/pic",
            |ctx: &mut Context, _tag| {
                let id = ctx.param("id").unwrap_or("?").to_string();
                ctx.resp_body = format!("{{\"id\":{}}}", id).into_bytes();
                ctx.resp_content_type = "application/json".to_string();
                200
            },
            0,
        )
        .unwrap();

    let file_for_handler = file_path.clone();
    let hooks = FnHooks(move |ctx: &mut Context| {
        match ctx.url.as_str() {
            "/root/timestamp/info" => {
                ctx.resp_body = b"ok".to_vec();
                ctx.resp_content_type = "text/plain".to_string();
                200
            }
            "/f" => {
                ctx.resp_body = file_for_handler.to_string_lossy().into_owned().into_bytes();
                ctx.resp_content_type = STATIC_FILE.to_string();
                200
            }
            _ => 0,
        }
    });

    let opts = ServerOptions {
        bind_host: "127.0.0.1".to_string(),
        port: 0,
        pool_size: 2,
        ban_40x,
        send_date: false,
        ..Default::default()
    };
    let server = HttpServer::bind(opts, router, Box::new(hooks), AuthEngine::none()).unwrap();
    let addr = server.local_addr();
    let running = server.start();
    (running, addr, dir)
}

fn send_request(addr: std::net::SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(raw).unwrap();
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out);
    String::from_utf8_lossy(&out).into_owned()
}

#[test]
fn static_rewrite_reaches_handler() {
    let (server, addr, _dir) = start_server(false);

    let res = send_request(
        addr,
        b"GET /info HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert!(res.contains("200 OK"), "{res}");
    assert!(res.ends_with("ok"), "{res}");

    server.shutdown();
}

#[test]
fn parametric_callback_and_404() {
    let (server, addr, _dir) = start_server(false);

    let res = send_request(
        addr,
        b"GET /user/42/pic HTTP/1.1\r\nHost: l\r\nConnection: close\r\n\r\n",
    );
    assert!(res.contains("200 OK"), "{res}");
    let body_start = res.find("\r\n\r\n").unwrap() + 4;
    let parsed: serde_json::Value = serde_json::from_str(&res[body_start..]).unwrap();
    assert_eq!(parsed["id"], 42);

    let res = send_request(
        addr,
        b"GET /user/x/pic HTTP/1.1\r\nHost: l\r\nConnection: close\r\n\r\n",
    );
    assert!(res.contains("404 Not Found"), "{res}");

    server.shutdown();
}

#[test]
fn ranged_static_file() {
    let (server, addr, _dir) = start_server(false);

    let res = send_request(
        addr,
        b"GET /f HTTP/1.1\r\nHost: l\r\nRange: bytes=100-199\r\nConnection: close\r\n\r\n",
    );
    assert!(res.contains("206 Partial Content"), "{res}");
    assert!(res.contains("Content-Range: bytes 100-199/10000"), "{res}");
    assert!(res.contains("Content-Length: 100"), "{res}");
    assert!(res.contains("Accept-Ranges: bytes"), "{res}");

    // Body equals bytes 100..=199 of the generated payload.
    let body_start = res.find("\r\n\r\n").unwrap() + 4;
    let body = &res.as_bytes()[body_start..];
    let expected: Vec<u8> = (100..200u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(body, expected.as_slice());

    server.shutdown();
}

#[test]
fn unsatisfiable_range_is_416() {
    let (server, addr, _dir) = start_server(false);

    let res = send_request(
        addr,
        b"GET /f HTTP/1.1\r\nHost: l\r\nRange: bytes=20000-\r\nConnection: close\r\n\r\n",
    );
    assert!(res.contains("416 Range Not Satisfiable"), "{res}");
    assert!(res.contains("Content-Length: 0"), "{res}");

    server.shutdown();
}

#[test]
fn keep_alive_serves_two_requests() {
    let (server, addr, _dir) = start_server(false);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    for _ in 0..2 {
        stream
            .write_all(b"GET /info HTTP/1.1\r\nHost: l\r\n\r\n")
            .unwrap();
        let mut buf = [0u8; 2048];
        let mut res = String::new();
        // Read until the 2-byte body arrives.
        loop {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "connection closed early");
            res.push_str(&String::from_utf8_lossy(&buf[..n]));
            if res.ends_with("ok") {
                break;
            }
        }
        assert!(res.contains("200 OK"), "{res}");
        assert!(res.contains("Connection: keep-alive"), "{res}");
    }

    server.shutdown();
}

#[test]
fn garbage_gets_400_and_ban_set_blocks_next() {
    let (server, addr, _dir) = start_server(true);

    let res = send_request(addr, b"GARBAGE\x01LINE\r\nmore\r\n\r\n");
    assert!(res.contains("400 Bad Request"), "{res}");

    // Next connection from the same (banned) IP gets the teapot body
    // before any parsing.
    let res = send_request(addr, b"GET /info HTTP/1.1\r\nHost: l\r\n\r\n");
    assert!(res.contains("418"), "{res}");
    assert!(res.contains("teapot"), "{res}");

    server.shutdown();
}

#[test]
fn http10_defaults_to_close() {
    let (server, addr, _dir) = start_server(false);

    let res = send_request(addr, b"GET /info HTTP/1.0\r\nHost: l\r\n\r\n");
    assert!(res.starts_with("HTTP/1.0 200 OK"), "{res}");
    assert!(res.contains("Connection: close"), "{res}");

    server.shutdown();
}

#[test]
fn post_body_is_delivered() {
    let router = Router::new();
    let hooks = FnHooks(|ctx: &mut Context| {
        if ctx.url == "/upload" {
            ctx.resp_body = format!("got {} bytes", ctx.body.len()).into_bytes();
            ctx.resp_content_type = "text/plain".to_string();
            200
        } else {
            0
        }
    });
    let opts = ServerOptions {
        bind_host: "127.0.0.1".to_string(),
        port: 0,
        pool_size: 1,
        send_date: false,
        ..Default::default()
    };
    let server = HttpServer::bind(opts, router, Box::new(hooks), AuthEngine::none()).unwrap();
    let addr = server.local_addr();
    let running = server.start();

    let res = send_request(
        addr,
        b"POST /upload HTTP/1.1\r\nHost: l\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
    );
    assert!(res.contains("got 5 bytes"), "{res}");

    running.shutdown();
}
