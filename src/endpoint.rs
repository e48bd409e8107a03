use crate::buffer::{Buffer, Egress, Ingress};
use crate::logging;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use mio::net::TcpStream;
use std::io;

/// One side of a proxied connection: a nonblocking stream plus bounded
/// inbound and outbound buffers, with its read interest managed on the shared
/// poll. Write interest is registered permanently; edge writable events only
/// fire on readiness transitions, and the flush path ignores spurious ones.
pub(crate) struct Endpoint {
    stream: TcpStream,
    token: mio::Token,
    read_buf: Buffer,
    write_buf: Buffer,
    readable: bool,
    registered: bool,
    log: logging::Logger,
}

impl Endpoint {
    pub fn new(
        stream: TcpStream,
        token: mio::Token,
        read_capacity: usize,
        write_capacity: usize,
        log: &logging::Logger,
    ) -> Endpoint {
        Endpoint {
            stream,
            token,
            read_buf: Buffer::new(read_capacity),
            write_buf: Buffer::new(write_capacity),
            readable: false,
            registered: false,
            log: log.new(logging::o!()),
        }
    }

    /// Registers the endpoint on the poll with the given read interest.
    pub fn register(&mut self, poll: &mio::Poll, readable: bool) -> NetworkResult<()> {
        assert!(!self.registered);

        poll.register(
            &self.stream,
            self.token,
            Self::interest(readable),
            mio::PollOpt::edge(),
        )
        .map_err(NetworkError::from)?;

        self.readable = readable;
        self.registered = true;

        logging::trace!(self.log, "endpoint registered";
                        "token" => self.token.0,
                        "readable" => readable);

        Ok(())
    }

    /// Masks or unmasks read readiness. Unmasking with bytes already pending
    /// on the socket produces a fresh edge event.
    pub fn set_readable(&mut self, poll: &mio::Poll, readable: bool) -> NetworkResult<()> {
        if !self.registered || self.readable == readable {
            return Ok(());
        }

        poll.reregister(
            &self.stream,
            self.token,
            Self::interest(readable),
            mio::PollOpt::edge(),
        )
        .map_err(NetworkError::from)?;

        self.readable = readable;

        logging::trace!(self.log, "endpoint read interest changed";
                        "token" => self.token.0,
                        "readable" => readable);

        Ok(())
    }

    pub fn deregister(&mut self, poll: &mio::Poll) {
        if !self.registered {
            return;
        }

        // A deregistration failure only matters if the stream were to be
        // reused, and it never is; the fd closes when the endpoint drops.
        drop(poll.deregister(&self.stream));
        self.registered = false;
    }

    #[inline]
    fn interest(readable: bool) -> mio::Ready {
        match readable {
            true => mio::Ready::readable() | mio::Ready::writable(),
            false => mio::Ready::writable(),
        }
    }

    /// Checks the outcome of a nonblocking connect after the first readiness
    /// event on the stream.
    pub fn connect_result(&self) -> io::Result<()> {
        match self.stream.take_error()? {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drains the socket into the read buffer.
    pub fn receive(&mut self) -> NetworkResult<Ingress> {
        let stream = &self.stream;
        self.read_buf.ingress(stream).map_err(NetworkError::from)
    }

    /// Flushes the write buffer to the socket. Returns `Egress::Blocked` when
    /// the socket stops accepting; a later writable event resumes it.
    pub fn flush(&mut self) -> NetworkResult<Egress> {
        if self.write_buf.is_empty() {
            return Ok(Egress::Drained(0));
        }

        let stream = &self.stream;
        match self.write_buf.egress(stream) {
            Ok(egress) => Ok(egress),
            Err(ref err) if err.kind() == io::ErrorKind::WriteZero => {
                Err(NetworkError::Fatal(ErrorType::Closed))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Queues as much of `bytes` as fits in the outbound buffer, returning
    /// the count queued.
    #[inline]
    pub fn queue(&mut self, bytes: &[u8]) -> usize {
        self.write_buf.extend(bytes)
    }

    /// Queues `bytes`, flushing the socket to make room when the buffer
    /// fills. A short count means the socket itself is backed up, which
    /// guarantees a writable event once it drains; a full buffer alone never
    /// gates progress.
    pub fn queue_through(&mut self, bytes: &[u8]) -> NetworkResult<usize> {
        let mut queued = self.write_buf.extend(bytes);

        while queued < bytes.len() {
            match self.flush()? {
                Egress::Blocked(_) | Egress::Drained(0) => break,
                Egress::Drained(_) => {
                    queued += self.write_buf.extend(&bytes[queued..]);
                }
            }
        }

        Ok(queued)
    }

    #[inline]
    pub fn write_free(&self) -> usize {
        self.write_buf.free_capacity()
    }

    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buf.is_empty()
    }

    #[inline]
    pub fn read_buf(&self) -> &Buffer {
        &self.read_buf
    }

    #[inline]
    pub fn read_buf_mut(&mut self) -> &mut Buffer {
        &mut self.read_buf
    }
}
