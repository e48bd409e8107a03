//! End-to-end scenarios against in-process origins: an HTTP echo server and a
//! raw byte echo service, with clients speaking through the proxy over
//! loopback.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use torpor::{CallbackTable, Proxy, ProxyConfig};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP origin that echoes the request method, and the body after it when
/// one was sent: `GET` → `GET`, `PUT` with `zomg` → `PUT zomg`.
fn spawn_echo_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            thread::spawn(move || echo_one(stream));
        }
    });

    port
}

fn echo_one(mut stream: TcpStream) {
    stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => return,
        }
    }

    let head_text = String::from_utf8_lossy(&head).into_owned();
    let method = head_text.split_whitespace().next().unwrap_or("").to_string();

    let content_length = head_text
        .lines()
        .find(|line| line.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|line| line.split(':').nth(1))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    if content_length > 0 && stream.read_exact(&mut body).is_err() {
        return;
    }

    let mut reply_body = method.into_bytes();
    if !body.is_empty() {
        reply_body.push(b' ');
        reply_body.extend_from_slice(&body);
    }

    let reply = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
        reply_body.len()
    );
    let _ = stream.write_all(reply.as_bytes());
    let _ = stream.write_all(&reply_body);
}

/// Raw service that echoes every byte back until the peer closes.
fn spawn_raw_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(count) => {
                            if stream.write_all(&buf[..count]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    port
}

/// Origin speaking raw HTTP/1.1, replying with a fixed byte string and then
/// closing. Used for framings the echo origin does not produce.
fn spawn_fixed_origin(reply: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            thread::spawn(move || {
                stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte) {
                        Ok(1) => head.push(byte[0]),
                        _ => return,
                    }
                }
                let _ = stream.write_all(reply);
            });
        }
    });

    port
}

struct ProxyHarness {
    proxy: Arc<Proxy>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ProxyHarness {
    fn start() -> ProxyHarness {
        Self::start_with(None)
    }

    fn start_with(callbacks: Option<CallbackTable>) -> ProxyHarness {
        let proxy = Arc::new(Proxy::bind(ProxyConfig::default(), None).unwrap());
        if callbacks.is_some() {
            proxy.set_callbacks(callbacks);
        }

        let thread = {
            let proxy = proxy.clone();
            thread::spawn(move || proxy.start().unwrap())
        };

        for _ in 0..100 {
            if proxy.running() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(proxy.running(), "proxy failed to start");

        ProxyHarness {
            proxy,
            thread: Some(thread),
        }
    }

    fn port(&self) -> u16 {
        self.proxy.port()
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.proxy.stop();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

fn request_via_proxy(proxy_port: u16, request: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port))?;
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    stream.write_all(request)?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    Ok(response)
}

fn proxied_get(proxy_port: u16, origin_port: u16) -> Vec<u8> {
    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin_port, origin_port
    );
    request_via_proxy(proxy_port, request.as_bytes()).unwrap()
}

fn direct_get(origin_port: u16) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", origin_port)).unwrap();
    stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    response
}

fn response_body(response: &[u8]) -> &[u8] {
    let split = response
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("response has no head/body split");
    &response[split + 4..]
}

#[test]
fn test_not_running_before_start() {
    let proxy = Proxy::bind(ProxyConfig::default(), None).unwrap();
    assert_ne!(proxy.port(), 0);
    assert!(!proxy.running());
}

#[test]
fn test_running_lifecycle() {
    let proxy = Arc::new(Proxy::bind(ProxyConfig::default(), None).unwrap());
    assert!(!proxy.running());

    let thread = {
        let proxy = proxy.clone();
        thread::spawn(move || proxy.start().unwrap())
    };

    for _ in 0..100 {
        if proxy.running() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(proxy.running());

    let stopped_at = Instant::now();
    proxy.stop();
    thread.join().unwrap();

    assert!(stopped_at.elapsed() < Duration::from_secs(1));
    assert!(!proxy.running());
}

#[test]
fn test_get_passthrough() {
    let origin = spawn_echo_origin();
    let proxy = ProxyHarness::start();

    let direct = direct_get(origin);
    assert!(direct.starts_with(b"HTTP/1.1 200 OK"));
    assert_eq!(response_body(&direct), b"GET");

    let proxied = proxied_get(proxy.port(), origin);
    assert_eq!(proxied, direct);
}

#[test]
fn test_put_with_body_passthrough() {
    let origin = spawn_echo_origin();
    let proxy = ProxyHarness::start();

    let request = format!(
        "PUT http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: 4\r\n\r\nzomg",
        origin, origin
    );
    let response = request_via_proxy(proxy.port(), request.as_bytes()).unwrap();

    assert!(response.starts_with(b"HTTP/1.1 200 OK"));
    assert_eq!(response_body(&response), b"PUT zomg");
}

#[test]
fn test_repeated_gets_match() {
    let origin = spawn_echo_origin();
    let proxy = ProxyHarness::start();

    let first = proxied_get(proxy.port(), origin);
    for _ in 0..4 {
        assert_eq!(proxied_get(proxy.port(), origin), first);
    }
}

#[test]
fn test_connect_tunnel() {
    let raw = spawn_raw_echo();
    let proxy = ProxyHarness::start();

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.port())).unwrap();
    stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();

    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", raw);
    stream.write_all(request.as_bytes()).unwrap();

    // The establishment reply arrives first, byte-exact.
    let mut preamble = vec![0u8; CONNECT_ESTABLISHED.len()];
    stream.read_exact(&mut preamble).unwrap();
    assert_eq!(preamble, CONNECT_ESTABLISHED);

    // Then the tunnel is opaque in both directions.
    let payload: Vec<u8> = (0..100_000).map(|_| rand::random::<u8>()).collect();
    for chunk in payload.chunks(8192) {
        stream.write_all(chunk).unwrap();
    }

    let mut echoed = vec![0u8; payload.len()];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, payload);
}

#[test]
fn test_tunnel_payload_with_head() {
    // Tunnel bytes arriving in the same segment as the CONNECT head must not
    // be lost with the discarded request head.
    let raw = spawn_raw_echo();
    let proxy = ProxyHarness::start();

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.port())).unwrap();
    stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();

    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\nhello tunnel", raw);
    stream.write_all(request.as_bytes()).unwrap();

    let mut preamble = vec![0u8; CONNECT_ESTABLISHED.len()];
    stream.read_exact(&mut preamble).unwrap();
    assert_eq!(preamble, CONNECT_ESTABLISHED);

    let mut echoed = vec![0u8; b"hello tunnel".len()];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello tunnel");
}

#[test]
fn test_chunked_response_passthrough() {
    let origin = spawn_fixed_origin(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    );
    let proxy = ProxyHarness::start();

    let response = proxied_get(proxy.port(), origin);
    assert!(response.starts_with(b"HTTP/1.1 200 OK"));
    assert_eq!(
        response_body(&response),
        &b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"[..]
    );
}

#[test]
fn test_eof_delimited_response() {
    let origin = spawn_fixed_origin(b"HTTP/1.1 200 OK\r\n\r\nstream until close");
    let proxy = ProxyHarness::start();

    let response = proxied_get(proxy.port(), origin);
    assert!(response.starts_with(b"HTTP/1.1 200 OK"));
    assert_eq!(response_body(&response), b"stream until close");
}

#[test]
fn test_pause_delays_only_that_connection() {
    let origin = spawn_echo_origin();

    let first = Arc::new(AtomicBool::new(true));
    let mut callbacks = CallbackTable::default();
    callbacks.on_connect = Some(Box::new({
        let first = first.clone();
        move |conn: &mut torpor::ConnectionRef| {
            if first.swap(false, Ordering::SeqCst) {
                conn.insert_pause(Duration::from_millis(500));
            }
        }
    }));

    let proxy = ProxyHarness::start_with(Some(callbacks));
    let proxy_port = proxy.port();

    let delayed = thread::spawn(move || {
        let started = Instant::now();
        let response = proxied_get(proxy_port, origin);
        (started.elapsed(), response)
    });

    // Let the first connection be accepted (and paused) before the second.
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    let fast_response = proxied_get(proxy_port, origin);
    let fast_elapsed = started.elapsed();

    let (delayed_elapsed, delayed_response) = delayed.join().unwrap();

    assert_eq!(response_body(&delayed_response), b"GET");
    assert_eq!(response_body(&fast_response), b"GET");

    assert!(
        delayed_elapsed >= Duration::from_millis(500),
        "paused connection finished in {:?}",
        delayed_elapsed
    );
    assert!(
        fast_elapsed < Duration::from_millis(300),
        "unpaused connection took {:?}",
        fast_elapsed
    );
}

#[test]
fn test_hooks_fire_at_edges() {
    let origin = spawn_echo_origin();
    let raw = spawn_raw_echo();

    let connects = Arc::new(AtomicUsize::new(0));
    let direct_connects = Arc::new(AtomicUsize::new(0));
    let request_completes = Arc::new(AtomicUsize::new(0));

    let mut callbacks = CallbackTable::default();
    callbacks.on_connect = Some(Box::new({
        let connects = connects.clone();
        move |_: &mut torpor::ConnectionRef| {
            connects.fetch_add(1, Ordering::SeqCst);
        }
    }));
    callbacks.on_direct_connect = Some(Box::new({
        let direct_connects = direct_connects.clone();
        move |conn: &mut torpor::ConnectionRef| {
            assert!(conn.proxy().running());
            direct_connects.fetch_add(1, Ordering::SeqCst);
        }
    }));
    callbacks.on_request_complete = Some(Box::new({
        let request_completes = request_completes.clone();
        move |_: &mut torpor::ConnectionRef| {
            request_completes.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let proxy = ProxyHarness::start_with(Some(callbacks));

    assert_eq!(response_body(&proxied_get(proxy.port(), origin)), b"GET");

    let mut stream = TcpStream::connect(("127.0.0.1", proxy.port())).unwrap();
    stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", raw);
    stream.write_all(request.as_bytes()).unwrap();
    let mut preamble = vec![0u8; CONNECT_ESTABLISHED.len()];
    stream.read_exact(&mut preamble).unwrap();
    drop(stream);

    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(direct_connects.load(Ordering::SeqCst), 1);
    assert_eq!(request_completes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_origin_refused_then_next_request_succeeds() {
    // Grab a port with no listener behind it.
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let origin = spawn_echo_origin();
    let proxy = ProxyHarness::start();

    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        dead_port, dead_port
    );
    let response = request_via_proxy(proxy.port(), request.as_bytes()).unwrap();
    // Silent close: no synthesized error response.
    assert!(response.is_empty());

    // The proxy keeps serving.
    assert_eq!(response_body(&proxied_get(proxy.port(), origin)), b"GET");
}

#[test]
fn test_hook_panic_tears_down_only_that_connection() {
    let origin = spawn_echo_origin();

    let first = Arc::new(AtomicBool::new(true));
    let mut callbacks = CallbackTable::default();
    callbacks.on_connect = Some(Box::new({
        let first = first.clone();
        move |_: &mut torpor::ConnectionRef| {
            if first.swap(false, Ordering::SeqCst) {
                panic!("deliberate hook failure");
            }
        }
    }));

    let proxy = ProxyHarness::start_with(Some(callbacks));

    // The faulted connection just closes.
    let response = proxied_get_allow_empty(proxy.port(), origin);
    assert!(response.is_empty());

    // The reactor survives and serves the next one.
    assert_eq!(response_body(&proxied_get(proxy.port(), origin)), b"GET");
}

fn proxied_get_allow_empty(proxy_port: u16, origin_port: u16) -> Vec<u8> {
    let request = format!(
        "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
        origin_port, origin_port
    );
    match request_via_proxy(proxy_port, request.as_bytes()) {
        Ok(response) => response,
        // Reset by the teardown before our request went out.
        Err(_) => Vec::new(),
    }
}
