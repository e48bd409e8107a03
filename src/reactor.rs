//! Token bookkeeping and one-shot timers for the dispatch loop.
//!
//! Reactor tokens and timer entries carry arena indices, never references; a
//! lookup that misses the arena means the connection was already freed and
//! the event is simply dropped.

use std::time::{Duration, Instant};

pub(crate) const LISTENER: mio::Token = mio::Token(0);
pub(crate) const STOP: mio::Token = mio::Token(1);

const CONN_BASE: usize = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Side {
    Client,
    Origin,
}

#[inline]
pub(crate) fn client_token(id: usize) -> mio::Token {
    mio::Token(CONN_BASE + id * 2)
}

#[inline]
pub(crate) fn origin_token(id: usize) -> mio::Token {
    mio::Token(CONN_BASE + id * 2 + 1)
}

#[inline]
pub(crate) fn decode_token(token: mio::Token) -> (usize, Side) {
    let raw = token.0 - CONN_BASE;
    let side = match raw % 2 {
        0 => Side::Client,
        _ => Side::Origin,
    };
    (raw / 2, side)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum TimerKind {
    /// A hook-injected pause elapses.
    Pause,
    /// The origin connect deadline expires.
    Connect,
}

#[derive(Debug)]
struct Entry {
    at: Instant,
    conn: usize,
    kind: TimerKind,
}

/// One-shot timers, at most a handful live at a time (one per delayed or
/// connecting connection), kept in an unordered vec and scanned linearly.
pub(crate) struct Timers {
    entries: Vec<Entry>,
}

impl Timers {
    pub fn new() -> Timers {
        Timers {
            entries: Vec::new(),
        }
    }

    pub fn arm(&mut self, conn: usize, kind: TimerKind, at: Instant) {
        self.cancel(conn, kind);
        self.entries.push(Entry { at, conn, kind });
    }

    pub fn cancel(&mut self, conn: usize, kind: TimerKind) {
        self.entries
            .retain(|entry| !(entry.conn == conn && entry.kind == kind));
    }

    pub fn cancel_all(&mut self, conn: usize) {
        self.entries.retain(|entry| entry.conn != conn);
    }

    /// Time until the earliest deadline, as a poll timeout. `None` when no
    /// timer is armed.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.entries
            .iter()
            .map(|entry| entry.at.saturating_duration_since(now))
            .min()
    }

    /// Drains every entry whose deadline has passed.
    pub fn expired(&mut self, now: Instant) -> Vec<(usize, TimerKind)> {
        let mut due = Vec::new();
        self.entries.retain(|entry| {
            if entry.at <= now {
                due.push((entry.conn, entry.kind));
                false
            } else {
                true
            }
        });
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        for id in &[0usize, 1, 7, 4096] {
            assert_eq!(decode_token(client_token(*id)), (*id, Side::Client));
            assert_eq!(decode_token(origin_token(*id)), (*id, Side::Origin));
        }
    }

    #[test]
    fn test_timer_expiry_and_rearm() {
        let mut timers = Timers::new();
        let now = Instant::now();

        timers.arm(3, TimerKind::Pause, now + Duration::from_millis(50));
        timers.arm(5, TimerKind::Connect, now + Duration::from_millis(10));

        assert_eq!(
            timers.next_timeout(now),
            Some(Duration::from_millis(10))
        );
        assert!(timers.expired(now).is_empty());

        let due = timers.expired(now + Duration::from_millis(20));
        assert_eq!(due, vec![(5, TimerKind::Connect)]);

        // Re-arming replaces the pending entry for the same connection.
        timers.arm(3, TimerKind::Pause, now + Duration::from_millis(100));
        let due = timers.expired(now + Duration::from_millis(60));
        assert!(due.is_empty());

        timers.cancel_all(3);
        assert_eq!(timers.next_timeout(now), None);
    }
}
