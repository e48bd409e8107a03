use slice_deque::SliceDeque;
use std::cmp::min;
use std::io;

type ByteDeque = SliceDeque<u8>;

/// Buffer capacities must be a multiple of this increment.
pub const BUF_SIZE_INCREMENT: usize = 65536;

/// Outcome of draining a nonblocking reader into the buffer.
#[derive(Debug, Eq, PartialEq)]
pub enum Ingress {
    /// The reader has no more data for now.
    Drained(usize),
    /// The buffer reached capacity with the reader still readable.
    Full(usize),
    /// The reader reached end of stream.
    Eof(usize),
}

impl Ingress {
    #[inline]
    pub fn count(&self) -> usize {
        match *self {
            Ingress::Drained(count) | Ingress::Full(count) | Ingress::Eof(count) => count,
        }
    }
}

/// Outcome of flushing the buffer into a nonblocking writer.
#[derive(Debug, Eq, PartialEq)]
pub enum Egress {
    /// All buffered data was written.
    Drained(usize),
    /// The writer blocked with data still buffered.
    Blocked(usize),
}

/// A contiguous FIFO byte queue with a fixed capacity bound. Data is appended
/// at the tail and consumed from the head; both the filled region and the free
/// region are always single contiguous slices.
///
/// The capacity bound is what gives endpoints their back-pressure: an
/// `ingress` stops at capacity and a writer that cannot keep up leaves the
/// buffer `Full` until the consumer drains it.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        if size == 0 || size % BUF_SIZE_INCREMENT != 0 {
            panic!(
                "Buffer size must be a nonzero multiple of {}, got {}",
                BUF_SIZE_INCREMENT, size
            );
        }

        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining free capacity.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Discards `count` bytes from the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.data.len());
        unsafe { self.data.move_head(count as isize) }
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        unsafe { self.data.move_head(len as isize) };
    }

    /// Appends as much of `bytes` as fits, returning the count appended.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) -> usize {
        let count = min(self.free_capacity(), bytes.len());
        unsafe {
            self.data.tail_head_slice()[..count].copy_from_slice(&bytes[..count]);
            self.data.move_tail(count as isize);
        }
        count
    }

    /// Reads from `reader` until it blocks, closes, or the buffer is full.
    /// `WouldBlock` is folded into `Ingress::Drained`; only genuine transport
    /// errors surface as `Err`.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<Ingress> {
        let mut total = 0;

        loop {
            let free = self.free_capacity();
            if free == 0 {
                return Ok(Ingress::Full(total));
            }

            unsafe {
                let slice = self.data.tail_head_slice();
                let bound = min(free, slice.len());
                match reader.read(&mut slice[..bound]) {
                    Ok(0) => return Ok(Ingress::Eof(total)),
                    Ok(count) => {
                        self.data.move_tail(count as isize);
                        total += count;
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Ingress::Drained(total));
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
        }
    }

    /// Writes buffered data to `writer` until it blocks or the buffer drains.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<Egress> {
        let mut total = 0;

        while !self.data.is_empty() {
            match writer.write(&self.data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Egress::Blocked(total));
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(Egress::Drained(total))
    }
}
