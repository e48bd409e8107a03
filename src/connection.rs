//! The per-connection state machine and its driver.
//!
//! A connection owns the client endpoint, the origin endpoint once one
//! exists, both stream parsers, and the pause bookkeeping. All mutation
//! happens on the reactor thread, either from readiness dispatch or from
//! timer expiry; the driver advances the machine whenever the client side has
//! fresh bytes or the phase just changed.

use crate::buffer::Ingress;
use crate::callbacks::{self, HookKind};
use crate::config::ProxyConfig;
use crate::endpoint::Endpoint;
use crate::http::{ConnectTarget, RequestEvent, RequestParser, ResponseEvent, ResponseParser};
use crate::logging;
use crate::proxy::Shared;
use crate::reactor::{client_token, origin_token, Side, TimerKind, Timers};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use mio::net::TcpStream;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Instant;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Reactor-side services the connection needs while handling an event.
pub(crate) struct Ctx<'a> {
    pub poll: &'a mio::Poll,
    pub timers: &'a mut Timers,
    pub shared: &'a Arc<Shared>,
    pub config: &'a ProxyConfig,
}

/// What the dispatch loop should do with the connection afterwards.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Flow {
    Keep,
    Close,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Phase {
    /// Receiving request bytes; nothing known about the target yet.
    Recv,
    /// Origin connect in flight; client reads disabled.
    Connecting,
    /// Streaming request body through to the origin.
    RecvForward,
    /// Request fully received; forwarding the response.
    Forward,
    /// Response fully received; one trailing client flush remains.
    Complete,
    /// CONNECT accepted, consuming the residual request head.
    DirectParsing,
    /// Opaque bidirectional relay.
    Direct,
}

pub(crate) struct Connection {
    id: usize,
    phase: Phase,

    client: Endpoint,
    request: RequestParser,
    /// Bytes at the front of the client buffer already parsed but not yet
    /// forwarded (buffered while the origin connection was in flight, or cut
    /// short by origin back-pressure).
    peek_offset: usize,

    origin: Option<Endpoint>,
    response: ResponseParser,
    /// Response-side analogue of `peek_offset`, for client back-pressure.
    origin_peek: usize,
    origin_connected: bool,
    is_connect: bool,

    delay: Option<std::time::Duration>,
    paused: bool,
    /// Client reads masked until the origin write buffer drains.
    client_gate: bool,
    /// Origin reads masked until the client write buffer drains.
    origin_gate: bool,

    log: logging::Logger,
}

impl Connection {
    /// Builds the connection for a freshly accepted client socket, fires the
    /// `on_connect` hook, and arms the client endpoint for reading (masked
    /// when the hook inserted a pause).
    pub fn accept(
        id: usize,
        stream: TcpStream,
        ctx: &mut Ctx,
        log: &logging::Logger,
    ) -> NetworkResult<Connection> {
        let log = log.new(logging::o!("conn" => id));

        let mut conn = Connection {
            id,
            phase: Phase::Recv,
            client: Endpoint::new(
                stream,
                client_token(id),
                ctx.config.read_buffer_size,
                ctx.config.write_buffer_size,
                &log,
            ),
            request: RequestParser::new(),
            peek_offset: 0,
            origin: None,
            response: ResponseParser::new(),
            origin_peek: 0,
            origin_connected: false,
            is_connect: false,
            delay: None,
            paused: false,
            client_gate: false,
            origin_gate: false,
            log,
        };

        conn.fire_hook(ctx, HookKind::Connect)?;
        conn.client.register(ctx.poll, !conn.paused)?;

        logging::debug!(conn.log, "connection accepted"; "paused" => conn.paused);

        Ok(conn)
    }

    #[inline]
    pub fn phase_name(&self) -> &'static str {
        match self.phase {
            Phase::Recv => "recv",
            Phase::Connecting => "connecting",
            Phase::RecvForward => "recv_forward",
            Phase::Forward => "forward",
            Phase::Complete => "complete",
            Phase::DirectParsing => "direct_parsing",
            Phase::Direct => "direct",
        }
    }

    /// Releases reactor resources. The sockets close when the connection
    /// drops.
    pub fn teardown(&mut self, poll: &mio::Poll, timers: &mut Timers) {
        self.client.deregister(poll);
        if let Some(origin) = self.origin.as_mut() {
            origin.deregister(poll);
        }
        timers.cancel_all(self.id);

        logging::debug!(self.log, "connection closed"; "phase" => self.phase_name());
    }

    pub fn on_ready(&mut self, ctx: &mut Ctx, side: Side, ready: mio::Ready) -> NetworkResult<Flow> {
        match side {
            Side::Client => {
                if ready.is_readable() && self.can_read_client() {
                    let flow = self.on_client_data(ctx)?;
                    if flow == Flow::Close {
                        return Ok(flow);
                    }
                }
                if ready.is_writable() {
                    return self.on_client_writable(ctx);
                }
                Ok(Flow::Keep)
            }
            Side::Origin => {
                if !self.origin_connected {
                    return self.on_origin_connected(ctx);
                }
                if ready.is_readable() && self.can_read_origin() {
                    let flow = self.on_origin_data(ctx)?;
                    if flow == Flow::Close {
                        return Ok(flow);
                    }
                }
                if ready.is_writable() {
                    return self.on_origin_writable(ctx);
                }
                Ok(Flow::Keep)
            }
        }
    }

    pub fn on_timer(&mut self, ctx: &mut Ctx, kind: TimerKind) -> NetworkResult<Flow> {
        match kind {
            TimerKind::Connect => {
                if self.phase == Phase::Connecting {
                    logging::debug!(self.log, "origin connect deadline expired");
                    return Ok(Flow::Close);
                }
                Ok(Flow::Keep)
            }
            TimerKind::Pause => {
                logging::debug!(self.log, "pause elapsed"; "phase" => self.phase_name());
                self.paused = false;

                // Gates deferred while suspended are re-examined now.
                if self.client_gate {
                    let free = self
                        .origin
                        .as_ref()
                        .map(Endpoint::write_free)
                        .unwrap_or(0);
                    if free > 0 {
                        self.client_gate = false;
                    }
                }
                if self.origin_gate && self.client.write_free() > 0 {
                    self.origin_gate = false;
                }

                self.sync_read_interest(ctx)?;

                // One driver tick over whatever sat buffered while suspended.
                let flow = self.drive(ctx)?;
                if flow == Flow::Close {
                    return Ok(flow);
                }
                match self.origin_connected {
                    true => self.pump_origin(ctx),
                    false => Ok(Flow::Keep),
                }
            }
        }
    }

    // ---- read-interest policy ----

    fn can_read_client(&self) -> bool {
        if self.paused || self.client_gate {
            return false;
        }
        matches!(
            self.phase,
            Phase::Recv | Phase::RecvForward | Phase::DirectParsing | Phase::Direct
        )
    }

    fn can_read_origin(&self) -> bool {
        if self.paused || self.origin_gate || !self.origin_connected {
            return false;
        }
        matches!(self.phase, Phase::RecvForward | Phase::Forward | Phase::Direct)
    }

    /// Reconciles poll read interest with the current phase and masks.
    fn sync_read_interest(&mut self, ctx: &mut Ctx) -> NetworkResult<()> {
        let client_readable = self.can_read_client();
        let origin_readable = self.can_read_origin();

        self.client.set_readable(ctx.poll, client_readable)?;
        if let Some(origin) = self.origin.as_mut() {
            origin.set_readable(ctx.poll, origin_readable)?;
        }
        Ok(())
    }

    // ---- client side ----

    fn on_client_data(&mut self, ctx: &mut Ctx) -> NetworkResult<Flow> {
        loop {
            let ingress = self.client.receive()?;

            let flow = self.drive(ctx)?;
            if flow == Flow::Close {
                return Ok(flow);
            }

            match ingress {
                Ingress::Eof(_) => {
                    logging::debug!(self.log, "client closed"; "phase" => self.phase_name());
                    self.flush_origin()?;
                    return Ok(Flow::Close);
                }
                Ingress::Drained(_) => return Ok(Flow::Keep),
                Ingress::Full(_) => {
                    if !self.can_read_client() {
                        // Masked mid-stream; unmasking re-arms the edge.
                        return Ok(Flow::Keep);
                    }
                    if self.client.read_buf().free_capacity() == 0 {
                        // The parser cannot make progress inside one buffer's
                        // worth of bytes: oversized head or chunk line.
                        return Err(NetworkError::Fatal(ErrorType::Overrun));
                    }
                }
            }
        }
    }

    fn on_client_writable(&mut self, ctx: &mut Ctx) -> NetworkResult<Flow> {
        self.client.flush()?;

        if !self.paused && self.origin_gate && self.client.write_free() > 0 {
            self.origin_gate = false;
            self.sync_read_interest(ctx)?;
            return self.pump_origin(ctx);
        }

        if self.phase == Phase::Complete {
            return self.finish_complete();
        }

        Ok(Flow::Keep)
    }

    // ---- origin side ----

    fn on_origin_connected(&mut self, ctx: &mut Ctx) -> NetworkResult<Flow> {
        let origin = self
            .origin
            .as_mut()
            .expect("connecting state requires an origin stream");

        if let Err(err) = origin.connect_result() {
            // Silent teardown; the client sees EOF, never a synthesized error.
            logging::debug!(self.log, "origin connect failed"; "error" => %err);
            return Ok(Flow::Close);
        }

        self.origin_connected = true;
        ctx.timers.cancel(self.id, TimerKind::Connect);

        logging::debug!(self.log, "origin connected"; "connect" => self.is_connect);

        if self.is_connect {
            self.set_phase_direct_parsing(ctx)?;
            self.fire_hook(ctx, HookKind::DirectConnect)?;
        } else {
            self.set_phase_recv_forward(ctx)?;
        }

        if self.paused {
            return Ok(Flow::Keep);
        }

        // Push through anything buffered while the connect was in flight.
        self.drive(ctx)
    }

    fn on_origin_data(&mut self, ctx: &mut Ctx) -> NetworkResult<Flow> {
        loop {
            let ingress = self
                .origin
                .as_mut()
                .expect("origin data requires an origin stream")
                .receive()?;

            let flow = self.pump_origin(ctx)?;
            if flow == Flow::Close {
                return Ok(flow);
            }

            match ingress {
                Ingress::Eof(_) => return self.on_origin_eof(ctx),
                Ingress::Drained(_) => return Ok(Flow::Keep),
                Ingress::Full(_) => {
                    if !self.can_read_origin() {
                        return Ok(Flow::Keep);
                    }
                    let free = self
                        .origin
                        .as_ref()
                        .expect("origin data requires an origin stream")
                        .read_buf()
                        .free_capacity();
                    if free == 0 {
                        return Err(NetworkError::Fatal(ErrorType::Overrun));
                    }
                }
            }
        }
    }

    fn on_origin_writable(&mut self, ctx: &mut Ctx) -> NetworkResult<Flow> {
        {
            let origin = self
                .origin
                .as_mut()
                .expect("origin writable requires an origin stream");
            origin.flush()?;
        }

        let free = self
            .origin
            .as_ref()
            .expect("origin writable requires an origin stream")
            .write_free();

        if !self.paused && self.client_gate && free > 0 {
            self.client_gate = false;
            self.sync_read_interest(ctx)?;
            if self.phase != Phase::Complete {
                // Replays the peeked prefix and resumes the advance pass.
                return self.drive(ctx);
            }
        }

        Ok(Flow::Keep)
    }

    fn on_origin_eof(&mut self, ctx: &mut Ctx) -> NetworkResult<Flow> {
        logging::debug!(self.log, "origin closed"; "phase" => self.phase_name());

        match self.phase {
            Phase::Direct => {
                // Tunnel over; relayed bytes already queued by the pump.
                self.client.flush()?;
                Ok(Flow::Close)
            }
            Phase::Forward => {
                if self.response.finish() {
                    self.set_phase_complete(ctx)?;
                    self.finish_complete()
                } else {
                    Ok(Flow::Close)
                }
            }
            Phase::Complete => self.finish_complete(),
            _ => Ok(Flow::Close),
        }
    }

    /// After Complete, the connection lives only until the trailing client
    /// write drains.
    fn finish_complete(&mut self) -> NetworkResult<Flow> {
        self.client.flush()?;
        match self.origin_peek == 0 && !self.client.has_egress() {
            true => Ok(Flow::Close),
            false => Ok(Flow::Keep),
        }
    }

    // ---- driver ----

    /// Advances the request side of the machine over the client buffer.
    ///
    /// Two passes: first settle the peeked prefix (forward it, or in the
    /// tunnel phases hold or discard the head residual), then walk the
    /// remaining bytes through the request parser, acting on the phase after
    /// every parse step. Bytes are never reordered and never dropped except
    /// for the CONNECT head residual at the Direct edge.
    fn drive(&mut self, ctx: &mut Ctx) -> NetworkResult<Flow> {
        debug_assert!(self.peek_offset <= self.client.read_buf().len());

        let mut skip = 0usize;

        if self.peek_offset > 0 {
            match self.phase {
                Phase::Direct => {
                    // Re-entry past the tunnel edge; the prefix is head
                    // residual and never reaches the origin.
                    let count = self.peek_offset;
                    self.client.read_buf_mut().consume(count);
                    self.peek_offset = 0;
                }
                Phase::DirectParsing => {
                    // The parsed CONNECT head. It stays buffered until the
                    // parser reports completion; the Direct edge drops it.
                    skip = self.peek_offset;
                    self.peek_offset = 0;
                }
                _ if self.origin_connected => {
                    let queued = {
                        let slice = &self.client.read_buf().read_slice()[..self.peek_offset];
                        self.origin
                            .as_mut()
                            .expect("peeked bytes require an origin")
                            .queue_through(slice)?
                    };
                    self.client.read_buf_mut().consume(queued);
                    self.peek_offset -= queued;

                    if self.peek_offset > 0 {
                        self.client_gate = true;
                        self.sync_read_interest(ctx)?;
                        return Ok(Flow::Keep);
                    }
                }
                _ => {
                    // Connect still in flight; the post-connect tick replays.
                    return Ok(Flow::Keep);
                }
            }
        }

        loop {
            if self.paused {
                break;
            }

            let buffered = self.client.read_buf().len();
            // In DirectParsing the parser still owes the completion event for
            // the bodiless CONNECT request; it runs even on an empty slice so
            // the Direct edge fires when no tunnel bytes followed the head.
            if buffered <= skip && self.phase != Phase::DirectParsing {
                break;
            }

            if self.phase == Phase::Direct {
                debug_assert_eq!(skip, 0);
                let queued = {
                    let slice = &self.client.read_buf().read_slice()[..buffered];
                    self.origin
                        .as_mut()
                        .expect("direct relay requires an origin")
                        .queue_through(slice)?
                };
                self.client.read_buf_mut().consume(queued);
                if queued < buffered {
                    self.client_gate = true;
                    self.sync_read_interest(ctx)?;
                    break;
                }
                continue;
            }

            let (consumed, event) = {
                let slice = &self.client.read_buf().read_slice()[skip..];
                self.request.execute(slice)?
            };

            let had_event = event.is_some();
            if let Some(event) = event {
                self.apply_request_event(ctx, event)?;
            }

            let mut stop = false;
            match self.phase {
                Phase::Recv => {
                    // No target yet; keep the bytes buffered.
                    skip += consumed;
                }
                Phase::Connecting => {
                    skip += consumed;
                    stop = true;
                }
                Phase::RecvForward | Phase::Forward => {
                    debug_assert_eq!(skip, 0);
                    let queued = {
                        let slice = &self.client.read_buf().read_slice()[..consumed];
                        self.origin
                            .as_mut()
                            .expect("forwarding requires an origin")
                            .queue_through(slice)?
                    };
                    self.client.read_buf_mut().consume(queued);

                    let short = consumed - queued;
                    if short > 0 {
                        // Parsed but unwritten; replays once the origin drains.
                        skip = short;
                        self.client_gate = true;
                        self.sync_read_interest(ctx)?;
                        stop = true;
                    } else if self.phase == Phase::Forward {
                        stop = true;
                    }
                }
                Phase::Direct => {
                    // The tunnel edge: drop the head residual; anything left
                    // is payload and relays on the next iteration.
                    self.client.read_buf_mut().consume(skip + consumed);
                    skip = 0;
                }
                Phase::DirectParsing | Phase::Complete => {
                    // A parse step never leaves the machine here: completion
                    // in DirectParsing flips straight to Direct, and Complete
                    // disables the client side entirely.
                    debug_assert!(false, "parse step ended in {}", self.phase_name());
                    return Err(NetworkError::Fatal(ErrorType::Phase));
                }
            }

            if stop {
                break;
            }
            if consumed == 0 && !had_event {
                break;
            }
        }

        self.peek_offset = skip;
        debug_assert!(self.peek_offset <= self.client.read_buf().len());

        self.flush_origin()?;
        Ok(Flow::Keep)
    }

    fn apply_request_event(&mut self, ctx: &mut Ctx, event: RequestEvent) -> NetworkResult<()> {
        match event {
            RequestEvent::Target { target, connect } => {
                debug_assert_eq!(self.phase, Phase::Recv);
                self.is_connect = connect;
                self.set_phase_connecting(ctx, target)
            }
            RequestEvent::Complete => match self.phase {
                Phase::RecvForward => {
                    self.set_phase_forward(ctx)?;
                    self.fire_hook(ctx, HookKind::RequestComplete)
                }
                Phase::DirectParsing => self.set_phase_direct(ctx),
                _ => {
                    debug_assert!(false, "message completion in unexpected phase");
                    Err(NetworkError::Fatal(ErrorType::Phase))
                }
            },
        }
    }

    // ---- response pump ----

    /// Advances the response side: relays in Direct, otherwise parses the
    /// origin buffer and forwards it to the client, transitioning to Complete
    /// when the message ends while the request side is already done.
    fn pump_origin(&mut self, ctx: &mut Ctx) -> NetworkResult<Flow> {
        if self.phase == Phase::Direct {
            loop {
                let buffered = self
                    .origin
                    .as_ref()
                    .expect("direct relay requires an origin")
                    .read_buf()
                    .len();
                if buffered == 0 {
                    break;
                }
                let queued = {
                    let origin = self.origin.as_ref().expect("direct relay requires an origin");
                    let slice = &origin.read_buf().read_slice()[..buffered];
                    self.client.queue_through(slice)?
                };
                self.origin
                    .as_mut()
                    .expect("direct relay requires an origin")
                    .read_buf_mut()
                    .consume(queued);
                if queued < buffered {
                    self.origin_gate = true;
                    self.sync_read_interest(ctx)?;
                    break;
                }
            }
            self.client.flush()?;
            return Ok(Flow::Keep);
        }

        if self.origin_peek > 0 {
            let queued = {
                let origin = self.origin.as_ref().expect("peeked response requires an origin");
                let slice = &origin.read_buf().read_slice()[..self.origin_peek];
                self.client.queue_through(slice)?
            };
            self.origin
                .as_mut()
                .expect("peeked response requires an origin")
                .read_buf_mut()
                .consume(queued);
            self.origin_peek -= queued;

            if self.origin_peek > 0 {
                self.origin_gate = true;
                self.sync_read_interest(ctx)?;
                return Ok(Flow::Keep);
            }
        }

        loop {
            if self.phase == Phase::Complete {
                // Extraneous bytes after the response completed; dropped.
                self.origin
                    .as_mut()
                    .expect("response pump requires an origin")
                    .read_buf_mut()
                    .clear();
                break;
            }

            let (consumed, event) = {
                let origin = self.origin.as_ref().expect("response pump requires an origin");
                let slice = origin.read_buf().read_slice();
                if slice.is_empty() {
                    break;
                }
                self.response.execute(slice)?
            };
            let completed = matches!(event, Some(ResponseEvent::Complete));

            let queued = {
                let origin = self.origin.as_ref().expect("response pump requires an origin");
                let slice = &origin.read_buf().read_slice()[..consumed];
                self.client.queue_through(slice)?
            };
            self.origin
                .as_mut()
                .expect("response pump requires an origin")
                .read_buf_mut()
                .consume(queued);
            let short = consumed - queued;

            if completed {
                if self.phase == Phase::Forward {
                    self.set_phase_complete(ctx)?;
                } else {
                    // Interim response; further frames may follow.
                    logging::debug!(self.log, "premature response completion";
                                    "phase" => self.phase_name());
                    self.response.reset();
                }
            }

            if short > 0 {
                self.origin_peek = short;
                self.origin_gate = true;
                self.sync_read_interest(ctx)?;
                break;
            }

            if consumed == 0 && !completed {
                break;
            }
        }

        self.client.flush()?;
        if self.phase == Phase::Complete {
            return self.finish_complete();
        }
        Ok(Flow::Keep)
    }

    // ---- transitions ----

    fn set_phase_connecting(&mut self, ctx: &mut Ctx, target: ConnectTarget) -> NetworkResult<()> {
        assert_eq!(self.phase, Phase::Recv);

        let addr = resolve(&target)?;

        logging::debug!(self.log, "connecting";
                        "host" => &target.host,
                        "port" => target.port,
                        "addr" => %addr,
                        "connect" => self.is_connect);

        let stream = TcpStream::connect(&addr).map_err(NetworkError::from)?;
        let mut origin = Endpoint::new(
            stream,
            origin_token(self.id),
            ctx.config.read_buffer_size,
            ctx.config.write_buffer_size,
            &self.log,
        );
        origin.register(ctx.poll, false)?;
        self.origin = Some(origin);

        self.phase = Phase::Connecting;
        ctx.timers.arm(
            self.id,
            TimerKind::Connect,
            Instant::now() + ctx.config.connect_deadline(),
        );
        self.sync_read_interest(ctx)
    }

    fn set_phase_recv_forward(&mut self, ctx: &mut Ctx) -> NetworkResult<()> {
        assert_eq!(self.phase, Phase::Connecting);
        self.phase = Phase::RecvForward;
        self.response.reset();
        self.sync_read_interest(ctx)
    }

    fn set_phase_forward(&mut self, ctx: &mut Ctx) -> NetworkResult<()> {
        assert_eq!(self.phase, Phase::RecvForward);
        self.phase = Phase::Forward;
        logging::debug!(self.log, "request complete");
        self.sync_read_interest(ctx)
    }

    fn set_phase_complete(&mut self, ctx: &mut Ctx) -> NetworkResult<()> {
        assert_eq!(self.phase, Phase::Forward);
        self.phase = Phase::Complete;
        logging::debug!(self.log, "response complete");
        self.sync_read_interest(ctx)
    }

    fn set_phase_direct_parsing(&mut self, ctx: &mut Ctx) -> NetworkResult<()> {
        assert_eq!(self.phase, Phase::Connecting);
        self.phase = Phase::DirectParsing;
        self.sync_read_interest(ctx)
    }

    fn set_phase_direct(&mut self, ctx: &mut Ctx) -> NetworkResult<()> {
        assert_eq!(self.phase, Phase::DirectParsing);
        self.phase = Phase::Direct;

        // The establishment reply precedes any tunneled byte.
        let queued = self.client.queue(CONNECT_ESTABLISHED);
        if queued < CONNECT_ESTABLISHED.len() {
            return Err(NetworkError::Fatal(ErrorType::Overrun));
        }
        self.client.flush()?;

        logging::debug!(self.log, "tunnel established");
        self.sync_read_interest(ctx)
    }

    // ---- hooks and pauses ----

    fn fire_hook(&mut self, ctx: &mut Ctx, kind: HookKind) -> NetworkResult<()> {
        let table = ctx.shared.callbacks();

        if callbacks::dispatch(&table, kind, ctx.shared, &mut self.delay).is_err() {
            logging::warn!(self.log, "callback panicked"; "hook" => ?kind);
            return Err(NetworkError::Fatal(ErrorType::Hook));
        }

        if let Some(duration) = self.delay.take() {
            logging::debug!(self.log, "pause inserted";
                            "hook" => ?kind,
                            "delay_ms" => duration.as_millis() as u64);
            ctx.timers
                .arm(self.id, TimerKind::Pause, Instant::now() + duration);
            self.paused = true;
            self.sync_read_interest(ctx)?;
        }

        Ok(())
    }

    fn flush_origin(&mut self) -> NetworkResult<()> {
        if let Some(origin) = self.origin.as_mut() {
            if origin.has_egress() {
                origin.flush()?;
            }
        }
        Ok(())
    }
}

fn resolve(target: &ConnectTarget) -> NetworkResult<SocketAddr> {
    if let Ok(ip) = target.host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, target.port));
    }

    (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|_| NetworkError::Fatal(ErrorType::Resolve))?
        .next()
        .ok_or(NetworkError::Fatal(ErrorType::Resolve))
}
