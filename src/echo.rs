//! Peer-to-peer ping/pong clock synchronization.
//!
//! Both sides exchange `{org, recv, xmt, offset}` tuples on the hostinfo
//! topic. The offset estimate is the NTP-style two-way mean, folded into a
//! running average. `offset` advertised by the peer is kept as an advisory
//! bias only; it never feeds back into the estimate.

use crate::schema::EchoPayload;

/// Minimum interval between outgoing pings once the first exchange ran.
pub const PING_INTERVAL_NS: i64 = 16_000_000;

#[derive(Debug, Default)]
pub struct EchoState {
    pub request_sent_ns: i64,
    pub request_recv_ns: i64,
    pub response_sent_ns: i64,
    pub response_recv_ns: i64,
    /// Peer clock minus local clock.
    ns_offset: i64,
    /// Offset the peer advertises for itself.
    ns_offset_from_target: i64,
    last_ping_sent_ns: i64,
    pending_xmt: i64,
    established: bool,
}

impl EchoState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Build the next outgoing ping.
    pub fn make_ping(&mut self, now_ns: i64) -> EchoPayload {
        self.request_sent_ns = now_ns;
        self.last_ping_sent_ns = now_ns;
        self.pending_xmt = now_ns;
        EchoPayload {
            reply: 0,
            org: 0,
            recv: 0,
            xmt: now_ns,
            offset: self.ns_offset,
        }
    }

    /// Answer a peer ping received at `recv_ns`.
    pub fn make_pong(&mut self, ping: &EchoPayload, recv_ns: i64, now_ns: i64) -> EchoPayload {
        self.request_recv_ns = recv_ns;
        self.response_sent_ns = now_ns;
        self.ns_offset_from_target = ping.offset;
        EchoPayload {
            reply: 1,
            org: ping.xmt,
            recv: recv_ns,
            xmt: now_ns,
            offset: self.ns_offset,
        }
    }

    /// Fold in a pong for our outstanding ping. Returns false if the echoed
    /// origin does not match (stale or foreign reply).
    pub fn on_pong(&mut self, pong: &EchoPayload, now_ns: i64) -> bool {
        if pong.org != self.pending_xmt || self.pending_xmt == 0 {
            return false;
        }
        self.response_recv_ns = now_ns;
        self.pending_xmt = 0;
        let sample = ((pong.recv - pong.org) + (pong.xmt - now_ns)) / 2;
        self.ns_offset = if self.established {
            (self.ns_offset + sample) / 2
        } else {
            sample
        };
        self.established = true;
        self.ns_offset_from_target = pong.offset;
        true
    }

    pub fn to_target(&self, t_ns: i64) -> i64 {
        t_ns + self.ns_offset
    }

    pub fn from_target(&self, t_ns: i64) -> i64 {
        t_ns - self.ns_offset
    }

    pub fn offset_ns(&self) -> i64 {
        self.ns_offset
    }

    pub fn offset_from_target_ns(&self) -> i64 {
        self.ns_offset_from_target
    }

    /// True once at least one full ping/pong exchange completed.
    pub fn established(&self) -> bool {
        self.established
    }

    pub fn ping_due(&self, now_ns: i64) -> bool {
        self.last_ping_sent_ns == 0 || now_ns - self.last_ping_sent_ns >= PING_INTERVAL_NS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_delay_yields_zero_offset() {
        let mut echo = EchoState::new();
        let ping = echo.make_ping(1000);
        assert_eq!(ping.xmt, 1000);
        let pong = EchoPayload {
            reply: 1,
            org: 1000,
            recv: 1010,
            xmt: 1030,
            offset: 0,
        };
        assert!(echo.on_pong(&pong, 1040));
        assert_eq!(echo.offset_ns(), 0);
    }

    #[test]
    fn loopback_converges_within_three_exchanges() {
        let mut echo = EchoState::new();
        let mut now = 0i64;
        for _ in 0..3 {
            let ping = echo.make_ping(now);
            // Zero-delay loopback: peer sees and answers instantly.
            let pong = EchoPayload {
                reply: 1,
                org: ping.xmt,
                recv: now,
                xmt: now,
                offset: 0,
            };
            assert!(echo.on_pong(&pong, now));
            now += PING_INTERVAL_NS;
        }
        assert!(echo.offset_ns().abs() <= 1_000);
        assert!(echo.established());
    }

    #[test]
    fn offset_tracks_skewed_peer() {
        let mut echo = EchoState::new();
        let skew = 5_000_000i64;
        let mut now = 0i64;
        for _ in 0..8 {
            let ping = echo.make_ping(now);
            let pong = EchoPayload {
                reply: 1,
                org: ping.xmt,
                recv: now + skew,
                xmt: now + skew,
                offset: 0,
            };
            assert!(echo.on_pong(&pong, now));
            now += PING_INTERVAL_NS;
        }
        assert!((echo.offset_ns() - skew).abs() <= 100);
        assert_eq!(echo.to_target(0), echo.offset_ns());
        assert_eq!(echo.from_target(echo.to_target(123)), 123);
    }

    #[test]
    fn foreign_pong_ignored() {
        let mut echo = EchoState::new();
        echo.make_ping(1000);
        let pong = EchoPayload {
            reply: 1,
            org: 999,
            recv: 1010,
            xmt: 1030,
            offset: 0,
        };
        assert!(!echo.on_pong(&pong, 1040));
        assert!(!echo.established());
    }

    #[test]
    fn pong_stores_peer_offset_as_bias_only() {
        let mut echo = EchoState::new();
        let ping = echo.make_ping(100);
        let pong = EchoPayload {
            reply: 1,
            org: ping.xmt,
            recv: 100,
            xmt: 100,
            offset: 777,
        };
        assert!(echo.on_pong(&pong, 100));
        assert_eq!(echo.offset_from_target_ns(), 777);
        assert_eq!(echo.offset_ns(), 0);
    }
}
