//! Host-facing proxy handle and the reactor dispatch loop.
//!
//! `bind` sets up the listener, the poll, and the stop wake-up; `start` runs
//! the dispatch loop on the calling thread until `stop` is invoked (from any
//! thread). Connections live in an arena indexed by reactor tokens; a slot
//! freed during a dispatch cycle only becomes reusable on the next cycle, so
//! readiness events already drained from the poll can never land on a
//! recycled connection.

use crate::callbacks::CallbackTable;
use crate::config::ProxyConfig;
use crate::connection::{Connection, Ctx, Flow};
use crate::logging;
use crate::reactor::{decode_token, TimerKind, Timers, LISTENER, STOP};
use crate::support::{NetworkError, NetworkResult, ProxyError};
use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

const STATE_INIT: usize = 0;
const STATE_RUNNING: usize = 1;
const STATE_TERMINATED: usize = 2;

const EVENT_CAPACITY: usize = 1024;

/// Proxy state reachable from outside the reactor thread. Only `run_state`
/// is mutated cross-thread, through the release stores in `start`/`stop`.
pub(crate) struct Shared {
    port: u16,
    run_state: AtomicUsize,
    stop_ready: mio::SetReadiness,
    callbacks: Mutex<Arc<CallbackTable>>,
}

impl Shared {
    #[inline]
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub(crate) fn running(&self) -> bool {
        self.run_state.load(Ordering::Acquire) == STATE_RUNNING
    }

    #[inline]
    fn terminated(&self) -> bool {
        self.run_state.load(Ordering::Acquire) == STATE_TERMINATED
    }

    #[inline]
    pub(crate) fn callbacks(&self) -> Arc<CallbackTable> {
        self.callbacks
            .lock()
            .expect("callback table lock poisoned")
            .clone()
    }
}

/// Reactor resources between runs. mio ties registrations to one poll for
/// their lifetime, so the poll built at bind time is carried across
/// start/stop cycles rather than recreated.
struct Parked {
    poll: mio::Poll,
    listener: TcpListener,
    stop_reg: mio::Registration,
    config: ProxyConfig,
}

/// An embeddable pausing HTTP forward proxy.
///
/// The instance is bound at construction; `start` blocks the calling thread
/// in the event loop, and `stop` is safe to call from any other thread.
pub struct Proxy {
    shared: Arc<Shared>,
    parked: Mutex<Option<Parked>>,
    log: logging::Logger,
}

impl Proxy {
    /// Binds a nonblocking, reusable listener per the configuration. With
    /// port 0 the kernel assigns one; look it up with [`Proxy::port`].
    pub fn bind<'a, L: Into<Option<&'a logging::Logger>>>(
        config: ProxyConfig,
        log: L,
    ) -> Result<Proxy, ProxyError> {
        config.validate()?;

        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::null(),
        };

        let ip: std::net::IpAddr = config.bind_address.parse()?;
        let listener = TcpListener::bind(&SocketAddr::new(ip, config.port))?;
        let port = listener.local_addr()?.port();

        let poll = mio::Poll::new()?;
        poll.register(
            &listener,
            LISTENER,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        let (stop_reg, stop_ready) = mio::Registration::new2();
        poll.register(&stop_reg, STOP, mio::Ready::readable(), mio::PollOpt::edge())?;

        logging::info!(log, "proxy bound";
                       "address" => &config.bind_address,
                       "port" => port);

        Ok(Proxy {
            shared: Arc::new(Shared {
                port,
                run_state: AtomicUsize::new(STATE_INIT),
                stop_ready,
                callbacks: Mutex::new(Arc::new(CallbackTable::default())),
            }),
            parked: Mutex::new(Some(Parked {
                poll,
                listener,
                stop_reg,
                config,
            })),
            log,
        })
    }

    /// The bound listener port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Installs or clears the hook table. The replacement is atomic from the
    /// reactor thread's perspective; in practice hosts call this before
    /// `start`.
    pub fn set_callbacks(&self, table: Option<CallbackTable>) {
        let table = Arc::new(table.unwrap_or_default());
        *self
            .shared
            .callbacks
            .lock()
            .expect("callback table lock poisoned") = table;
    }

    #[inline]
    pub fn running(&self) -> bool {
        self.shared.running()
    }

    /// Runs the dispatch loop on the calling thread until [`Proxy::stop`].
    pub fn start(&self) -> Result<(), ProxyError> {
        let parked = {
            let mut slot = self.parked.lock().expect("proxy state lock poisoned");
            slot.take().ok_or(ProxyError::AlreadyRunning)?
        };

        // A previous stop leaves the wake-up readiness set; clear it so the
        // next stop produces a fresh edge.
        drop(self.shared.stop_ready.set_readiness(mio::Ready::empty()));

        self.shared
            .run_state
            .store(STATE_RUNNING, Ordering::Release);

        logging::info!(self.log, "proxy started"; "port" => self.shared.port);

        let mut core = Core {
            shared: &self.shared,
            log: self.log.new(logging::o!()),
            poll: parked.poll,
            listener: parked.listener,
            stop_reg: parked.stop_reg,
            config: parked.config,
            events: mio::Events::with_capacity(EVENT_CAPACITY),
            conns: Vec::new(),
            free: Vec::new(),
            graveyard: Vec::new(),
            live: IndexSet::new(),
            timers: Timers::new(),
        };

        let result = core.run();
        core.shutdown();

        self.shared
            .run_state
            .store(STATE_TERMINATED, Ordering::Release);

        let Core {
            poll,
            listener,
            stop_reg,
            config,
            ..
        } = core;
        *self.parked.lock().expect("proxy state lock poisoned") = Some(Parked {
            poll,
            listener,
            stop_reg,
            config,
        });

        logging::info!(self.log, "proxy stopped");
        result
    }

    /// Terminates the dispatch loop. Safe from any thread; `start` returns
    /// in bounded time regardless of open connections.
    pub fn stop(&self) {
        self.shared
            .run_state
            .store(STATE_TERMINATED, Ordering::Release);
        drop(self.shared.stop_ready.set_readiness(mio::Ready::readable()));
    }
}

struct Core<'p> {
    shared: &'p Arc<Shared>,
    log: logging::Logger,
    poll: mio::Poll,
    listener: TcpListener,
    stop_reg: mio::Registration,
    config: ProxyConfig,
    events: mio::Events,
    conns: Vec<Option<Connection>>,
    free: Vec<usize>,
    graveyard: Vec<usize>,
    live: IndexSet<usize>,
    timers: Timers,
}

impl<'p> Core<'p> {
    fn run(&mut self) -> Result<(), ProxyError> {
        while !self.shared.terminated() {
            // Slots freed in the previous cycle become reusable now.
            self.free.extend(self.graveyard.drain(..));

            let timeout = self.timers.next_timeout(Instant::now());
            self.poll
                .poll(&mut self.events, timeout)
                .map_err(ProxyError::from)?;

            let ready: Vec<(mio::Token, mio::Ready)> = self
                .events
                .iter()
                .map(|event| (event.token(), event.readiness()))
                .collect();

            for (token, readiness) in ready {
                if token == STOP {
                    continue;
                }
                if token == LISTENER {
                    self.accept_ready();
                    continue;
                }
                self.connection_ready(token, readiness);
            }

            for (id, kind) in self.timers.expired(Instant::now()) {
                self.timer_ready(id, kind);
            }
        }

        Ok(())
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.accept_one(stream, peer),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn accept_one(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.conns.push(None);
                self.conns.len() - 1
            }
        };

        let result = {
            let mut ctx = Ctx {
                poll: &self.poll,
                timers: &mut self.timers,
                shared: self.shared,
                config: &self.config,
            };
            Connection::accept(id, stream, &mut ctx, &self.log)
        };

        match result {
            Ok(conn) => {
                logging::debug!(self.log, "client connected"; "peer" => %peer, "conn" => id);
                self.conns[id] = Some(conn);
                self.live.insert(id);
            }
            Err(err) => {
                logging::debug!(self.log, "connection setup failed";
                                "peer" => %peer,
                                "error" => ?err);
                self.timers.cancel_all(id);
                self.graveyard.push(id);
            }
        }
    }

    fn connection_ready(&mut self, token: mio::Token, readiness: mio::Ready) {
        let (id, side) = decode_token(token);

        let mut conn = match self.conns.get_mut(id).and_then(Option::take) {
            Some(conn) => conn,
            // Freed earlier in this cycle; the event is stale.
            None => return,
        };

        let result = {
            let mut ctx = Ctx {
                poll: &self.poll,
                timers: &mut self.timers,
                shared: self.shared,
                config: &self.config,
            };
            conn.on_ready(&mut ctx, side, readiness)
        };

        self.settle(id, conn, result);
    }

    fn timer_ready(&mut self, id: usize, kind: TimerKind) {
        let mut conn = match self.conns.get_mut(id).and_then(Option::take) {
            Some(conn) => conn,
            None => return,
        };

        let result = {
            let mut ctx = Ctx {
                poll: &self.poll,
                timers: &mut self.timers,
                shared: self.shared,
                config: &self.config,
            };
            conn.on_timer(&mut ctx, kind)
        };

        self.settle(id, conn, result);
    }

    fn settle(&mut self, id: usize, conn: Connection, result: NetworkResult<Flow>) {
        match result {
            Ok(Flow::Keep) | Err(NetworkError::Wait) => {
                self.conns[id] = Some(conn);
            }
            Ok(Flow::Close) => self.reap(id, conn),
            Err(err) => {
                logging::debug!(self.log, "connection failed";
                                "conn" => id,
                                "phase" => conn.phase_name(),
                                "error" => ?err);
                self.reap(id, conn);
            }
        }
    }

    fn reap(&mut self, id: usize, mut conn: Connection) {
        conn.teardown(&self.poll, &mut self.timers);
        self.live.swap_remove(&id);
        self.graveyard.push(id);
    }

    /// Abruptly frees whatever is still open when the loop exits. No drain is
    /// attempted.
    fn shutdown(&mut self) {
        logging::debug!(self.log, "dispatch loop exited";
                        "open_connections" => self.live.len());

        let open: Vec<usize> = self.live.drain(..).collect();
        for id in open {
            if let Some(mut conn) = self.conns.get_mut(id).and_then(Option::take) {
                conn.teardown(&self.poll, &mut self.timers);
            }
        }
    }
}
