extern crate ok_responder;

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use ok_responder::{ErrorKind, Server};


const OK_KEEP_ALIVE: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok";
const OK_CLOSE: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok";


fn spawn_server() -> SocketAddr {
    let server = Server::bind("127.0.0.1:0").expect("bind");
    let addr = server.local_addr();
    thread::spawn(move || {
        let _ = server.serve(ok_responder::respond);
    });
    addr
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream
}

/// Send `raw` and read until the server hangs up
fn exchange(addr: SocketAddr, raw: &[u8]) -> Vec<u8> {
    let mut stream = connect(addr);
    stream.write_all(raw).unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    out
}

/// Split a single response into (status, head, body)
fn parse_response(raw: &[u8]) -> (u16, String, Vec<u8>) {
    let split = raw.windows(4).position(|w| w == b"\r\n\r\n").expect("end of response head");
    let head = String::from_utf8(raw[..split].to_vec()).unwrap();
    let status = head[9..12].parse().unwrap();
    (status, head, raw[split + 4..].to_vec())
}


#[test]
fn get_root_without_headers() {
    let addr = spawn_server();
    let (status, _, body) = parse_response(&exchange(addr, b"GET / HTTP/1.0\r\n\r\n"));
    assert_eq!(status, 200);
    assert_eq!(body, b"ok");
}

#[test]
fn every_method_and_path_gets_ok() {
    let addr = spawn_server();
    let methods = ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS", "BREW"];
    let paths = ["/", "/anything", "/a/b/c?x=1"];
    for method in methods.iter() {
        for path in paths.iter() {
            let raw = format!("{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", method, path);
            assert_eq!(exchange(addr, raw.as_bytes()), OK_CLOSE, "{} {}", method, path);
        }
    }
}

#[test]
fn targets_the_uri_type_dislikes_still_get_ok() {
    let addr = spawn_server();
    let targets: &[&[u8]] = &[b"/{x}", b"/a\"b", b"/a`b", "/\u{e9}".as_bytes(), b"/a<b>",
                               b"/a|b", b"/a^b", b"*", b"/a%zz"];
    for target in targets {
        let mut raw = b"GET ".to_vec();
        raw.extend_from_slice(target);
        raw.extend_from_slice(b" HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert_eq!(exchange(addr, &raw), OK_CLOSE, "{}", String::from_utf8_lossy(target));
    }
}

#[test]
fn head_gets_headers_only() {
    let addr = spawn_server();
    let raw = exchange(addr, b"HEAD /x HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    let (status, head, body) = parse_response(&raw);
    assert_eq!(status, 200);
    assert!(head.contains("content-length: 2"));
    assert!(body.is_empty());
}

#[test]
fn json_body_does_not_leak_into_response() {
    let addr = spawn_server();
    let raw = exchange(addr, b"POST /submit HTTP/1.1\r\n\
                               Host: localhost\r\n\
                               Content-Type: application/json\r\n\
                               Content-Length: 7\r\n\
                               Connection: close\r\n\r\n\
                               {\"a\":1}");
    assert_eq!(raw, OK_CLOSE);
}

#[test]
fn chunked_body_is_consumed() {
    let addr = spawn_server();
    let raw = exchange(addr, b"POST /upload HTTP/1.1\r\n\
                               Transfer-Encoding: chunked\r\n\
                               Connection: close\r\n\r\n\
                               4\r\nabcd\r\n0\r\n\r\n");
    assert_eq!(raw, OK_CLOSE);
}

#[test]
fn body_arriving_late_is_waited_for() {
    let addr = spawn_server();
    let mut stream = connect(addr);
    stream.write_all(b"PUT /slow HTTP/1.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\nab").unwrap();
    thread::sleep(Duration::from_millis(100));
    stream.write_all(b"cde").unwrap();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    assert_eq!(out, OK_CLOSE);
}

#[test]
fn pipelined_requests_share_a_connection() {
    let addr = spawn_server();
    let raw = exchange(addr, b"GET /first HTTP/1.1\r\nHost: localhost\r\n\r\n\
                               POST /second HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc\
                               GET /third HTTP/1.1\r\nConnection: close\r\n\r\n");
    let mut expected = Vec::new();
    expected.extend_from_slice(OK_KEEP_ALIVE);
    expected.extend_from_slice(OK_KEEP_ALIVE);
    expected.extend_from_slice(OK_CLOSE);
    assert_eq!(raw, expected);
}

#[test]
fn keep_alive_connection_serves_sequential_requests() {
    let addr = spawn_server();
    let mut stream = connect(addr);
    for _ in 0..3 {
        stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let mut buf = vec![0; OK_KEEP_ALIVE.len()];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, OK_KEEP_ALIVE);
    }
}

#[test]
fn expect_continue_gets_interim_response() {
    let addr = spawn_server();
    let mut stream = connect(addr);
    stream.write_all(b"POST /big HTTP/1.1\r\n\
                       Expect: 100-continue\r\n\
                       Content-Length: 4\r\n\
                       Connection: close\r\n\r\n").unwrap();
    let mut interim = vec![0; b"HTTP/1.1 100 Continue\r\n\r\n".len()];
    stream.read_exact(&mut interim).unwrap();
    assert_eq!(interim, b"HTTP/1.1 100 Continue\r\n\r\n".to_vec());

    stream.write_all(b"data").unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    assert_eq!(out, OK_CLOSE);
}

#[test]
fn malformed_request_is_rejected_and_closed() {
    let addr = spawn_server();
    let (status, head, _) = parse_response(&exchange(addr, b"NOT A REQUEST\r\n\r\n"));
    assert_eq!(status, 400);
    assert!(head.contains("connection: close"));
}

#[test]
fn half_closed_client_still_gets_answer() {
    let addr = spawn_server();
    let mut stream = connect(addr);
    stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    let (status, _, body) = parse_response(&out);
    assert_eq!(status, 200);
    assert_eq!(body, b"ok");
}

#[test]
fn concurrent_requests_all_succeed() {
    let addr = spawn_server();
    let clients = (0..100).map(|i| {
        thread::spawn(move || {
            let raw = format!("GET /client/{} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", i);
            exchange(addr, raw.as_bytes())
        })
    }).collect::<Vec<_>>();
    for client in clients {
        assert_eq!(client.join().expect("client thread"), OK_CLOSE);
    }
}

#[test]
fn handler_panic_yields_500_and_server_survives() {
    let server = Server::bind("127.0.0.1:0").expect("bind");
    let addr = server.local_addr();
    thread::spawn(move || {
        let _ = server.serve(|request: ok_responder::Request| {
            if request.uri().path() == "/boom" {
                panic!("boom");
            }
            ok_responder::respond(request)
        });
    });

    let (status, _, _) = parse_response(&exchange(addr, b"GET /boom HTTP/1.1\r\nConnection: close\r\n\r\n"));
    assert_eq!(status, 500);
    assert_eq!(exchange(addr, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n"), OK_CLOSE);
}

#[test]
fn binding_a_taken_port_fails() {
    let first = Server::bind("127.0.0.1:0").expect("first bind");
    let err = match Server::bind(first.local_addr()) {
        Ok(_) => panic!("second bind on {} succeeded", first.local_addr()),
        Err(e) => e,
    };
    match *err.kind() {
        ErrorKind::Bind(ref addr) => assert_eq!(addr, &first.local_addr().to_string()),
        ref other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.iter().count() > 1, "underlying os error should be chained");
}

#[test]
fn client_that_never_reads_is_pushed_back() {
    let addr = spawn_server();
    let mut stream = connect(addr);
    stream.set_nonblocking(true).unwrap();

    let request = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
    let batch = request.iter().cloned().cycle().take(request.len() * 2048).collect::<Vec<u8>>();
    let limit = 256 * 1024 * 1024;
    let mut sent = 0;
    let mut stalls = 0;
    while stalls < 5 {
        assert!(sent < limit, "server kept reading {} bytes without its responses being read", sent);
        match stream.write(&batch) {
            Ok(n) => {
                sent += n;
                stalls = 0;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                stalls += 1;
                thread::sleep(Duration::from_millis(200));
            }
            Err(e) => panic!("write failed after {} bytes: {}", sent, e),
        }
    }
    drop(stream);

    assert_eq!(exchange(addr, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n"), OK_CLOSE);
}
