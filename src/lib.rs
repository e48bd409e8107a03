//! `torpor` is an embeddable HTTP forward proxy whose distinguishing feature
//! is deterministic per-connection delay injection.
//!
//! A host binds the proxy, optionally installs lifecycle hooks, and runs the
//! single-threaded event loop. Requests with absolute-form targets are
//! forwarded byte-for-byte to the origin named in the URI; `CONNECT` switches
//! the connection to an opaque bidirectional tunnel after the establishment
//! reply. From inside a hook, `insert_pause` suspends that one connection for
//! a caller-supplied duration without disturbing any other.
//!
//! ```no_run
//! use std::time::Duration;
//! use torpor::{CallbackTable, Proxy, ProxyConfig};
//!
//! let proxy = Proxy::bind(ProxyConfig::default(), None).unwrap();
//! println!("listening on port {}", proxy.port());
//!
//! let mut hooks = CallbackTable::default();
//! hooks.on_connect = Some(Box::new(|conn: &mut torpor::ConnectionRef| {
//!     conn.insert_pause(Duration::from_millis(500));
//! }));
//! proxy.set_callbacks(Some(hooks));
//!
//! proxy.start().unwrap();
//! ```

pub mod buffer;
pub mod callbacks;
pub mod config;
pub mod http;
pub mod logging;
pub mod support;

mod connection;
mod endpoint;
mod proxy;
mod reactor;

pub use crate::callbacks::{CallbackTable, ConnectionRef, Hook, ProxyRef};
pub use crate::config::ProxyConfig;
pub use crate::proxy::Proxy;
pub use crate::support::ProxyError;
