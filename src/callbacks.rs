//! Host-facing lifecycle hooks.
//!
//! Hooks run synchronously on the reactor thread at well-defined transitions
//! and must not block. The handle passed to a hook exposes only the proxy
//! back-reference and pause injection; a panic unwinding out of a hook tears
//! down that connection and nothing else.

use crate::proxy::Shared;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

pub type Hook = Box<dyn Fn(&mut ConnectionRef<'_>) + Send + Sync>;

/// The hook table installed with `Proxy::set_callbacks`. Every hook is
/// optional.
#[derive(Default)]
pub struct CallbackTable {
    /// Fired once per accepted client connection, before the first read.
    pub on_connect: Option<Hook>,
    /// Fired when a CONNECT request transitions to direct forwarding.
    pub on_direct_connect: Option<Hook>,
    /// Fired when a request has been fully received and the connection
    /// transitions to waiting on the origin response.
    pub on_request_complete: Option<Hook>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum HookKind {
    Connect,
    DirectConnect,
    RequestComplete,
}

/// Read-only view of the owning proxy, available inside hooks.
pub struct ProxyRef<'a> {
    shared: &'a Shared,
}

impl ProxyRef<'_> {
    /// The bound listener port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.shared.port()
    }

    #[inline]
    pub fn running(&self) -> bool {
        self.shared.running()
    }
}

/// The connection handle a hook receives.
pub struct ConnectionRef<'a> {
    shared: &'a Arc<Shared>,
    delay: &'a mut Option<Duration>,
}

impl<'a> ConnectionRef<'a> {
    /// The owning proxy.
    #[inline]
    pub fn proxy(&self) -> ProxyRef<'_> {
        ProxyRef {
            shared: self.shared,
        }
    }

    /// Delays the next action on this connection by `duration`.
    ///
    /// The pause is honored after the hook returns and applies exactly once;
    /// other connections are serviced normally while this one is suspended.
    #[inline]
    pub fn insert_pause(&mut self, duration: Duration) {
        *self.delay = Some(duration);
    }
}

/// Runs the selected hook, if installed. `Err` means the hook panicked.
pub(crate) fn dispatch(
    table: &CallbackTable,
    kind: HookKind,
    shared: &Arc<Shared>,
    delay: &mut Option<Duration>,
) -> Result<(), ()> {
    let hook = match kind {
        HookKind::Connect => &table.on_connect,
        HookKind::DirectConnect => &table.on_direct_connect,
        HookKind::RequestComplete => &table.on_request_complete,
    };

    let hook = match hook {
        Some(hook) => hook,
        None => return Ok(()),
    };

    let mut conn = ConnectionRef { shared, delay };
    panic::catch_unwind(AssertUnwindSafe(|| hook(&mut conn))).map_err(|_| ())
}
