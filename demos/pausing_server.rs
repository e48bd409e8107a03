//! Forward proxy that pauses every CONNECT tunnel for 30 seconds before the
//! first byte moves. Point a browser or curl at it and watch the stall:
//!
//! ```text
//! curl -x 127.0.0.1:31337 https://example.com/
//! ```

use std::process;
use std::time::Duration;

use torpor::{logging, CallbackTable, Proxy, ProxyConfig};

const PAUSE: Duration = Duration::from_secs(30);

fn main() {
    let log = logging::init();

    let config = ProxyConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 31337,
        ..ProxyConfig::default()
    };

    let proxy = match Proxy::bind(config, &log) {
        Ok(proxy) => proxy,
        Err(err) => {
            eprintln!("failed to initialize proxy: {}", err);
            process::exit(1);
        }
    };

    println!("proxy is listening on 127.0.0.1:{}", proxy.port());

    let mut callbacks = CallbackTable::default();
    callbacks.on_direct_connect = Some(Box::new(|conn: &mut torpor::ConnectionRef| {
        eprintln!("pausing post-CONNECT for {:?}...", PAUSE);
        conn.insert_pause(PAUSE);
    }));
    proxy.set_callbacks(Some(callbacks));

    println!("\n---> each CONNECT will pause for {:?} <---", PAUSE);

    if let Err(err) = proxy.start() {
        eprintln!("proxy exited with error: {}", err);
        process::exit(1);
    }
}
