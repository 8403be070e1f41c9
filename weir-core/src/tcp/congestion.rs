//! Reno congestion control with the NewReno fast-recovery refinement, as
//! described in [RFC 5681](https://www.rfc-editor.org/rfc/rfc5681.html) and
//! [RFC 6582](https://www.rfc-editor.org/rfc/rfc6582.html).
//!
//! The controller owns the arithmetic; the connection machine executes the
//! returned actions (retransmitting SND.UNA, sending a limited-transmit
//! segment) because it owns the queues and the window.

use super::seq::{seq_gt, seq_leq};

/// What the connection should do after processing an ACK of new data.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewAck {
    /// Not in recovery. Send whatever the window now allows.
    Open,
    /// A partial ACK during fast recovery. Retransmit the segment at
    /// SND.UNA and, if the window allows, send one new segment.
    /// `reset_rtx` is true for the first partial ACK of the episode.
    PartialAck { reset_rtx: bool },
    /// The ACK covered `recover`; fast recovery is over.
    FullAck,
}

/// What the connection should do after a duplicate ACK.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupAck {
    /// Nothing.
    Ignore,
    /// Dup ack one or two, or a later one during recovery: the window was
    /// inflated, so one new segment may go out if the guards allow.
    LimitedTransmit,
    /// The third duplicate: retransmit the segment at SND.UNA.
    FastRetransmit,
}

/// The Reno congestion state for one connection. All quantities are bytes.
#[derive(Debug, Clone, Copy)]
pub struct Reno {
    cwnd: u32,
    ssthresh: u32,
    /// SND.NXT when the current loss episode began. Partial ACKs below this
    /// do not end fast recovery (RFC 6582).
    recover: u32,
    dup_acks: u32,
    fast_recovery: bool,
    /// Whether the first partial ACK of the episode has been seen.
    fpack_seen: bool,
    smss: u32,
    /// The two most recent ACK positions, for the RFC 6582 heuristic that
    /// guards against entering recovery on acks of old data.
    highest_ack: u32,
    prev_highest_ack: u32,
}

impl Reno {
    /// A controller for a connection with the given sender MSS. `ssthresh`
    /// starts at the peer's advertised window; the initial congestion
    /// window follows RFC 5681: `min(4*SMSS, max(2*SMSS, 4380))`.
    pub fn new(smss: u32, initial_ssthresh: u32) -> Self {
        Self {
            cwnd: (4 * smss).min((2 * smss).max(4380)),
            ssthresh: initial_ssthresh.max(2 * smss),
            recover: 0,
            dup_acks: 0,
            fast_recovery: false,
            fpack_seen: false,
            smss,
            highest_ack: 0,
            prev_highest_ack: 0,
        }
    }

    /// Rebuilds a controller from persisted state, outside any loss
    /// episode.
    pub fn restore(smss: u32, cwnd: u32, ssthresh: u32, recover: u32) -> Self {
        Self {
            cwnd: cwnd.max(smss),
            ssthresh: ssthresh.max(2 * smss),
            recover,
            ..Self::new(smss, ssthresh)
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn recover(&self) -> u32 {
        self.recover
    }

    pub fn dup_acks(&self) -> u32 {
        self.dup_acks
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.fast_recovery
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    /// Updates the SMSS after option negotiation and re-derives the initial
    /// window from it.
    pub fn set_smss(&mut self, smss: u32) {
        self.smss = smss;
        self.cwnd = (4 * smss).min((2 * smss).max(4380));
    }

    /// Records the ACK positions used by the fast-retransmit heuristic.
    /// Call before SND.UNA advances.
    pub fn register_ack(&mut self, snd_una: u32, ack: u32) {
        self.prev_highest_ack = snd_una;
        self.highest_ack = ack;
    }

    /// An ACK advanced SND.UNA by `bytes_acked`.
    pub fn on_new_ack(&mut self, ack: u32, bytes_acked: u32, flight_size: u32, snd_nxt: u32) -> NewAck {
        if !self.fast_recovery {
            self.dup_acks = 0;
            self.recover = snd_nxt;
            if self.in_slow_start() {
                self.cwnd += bytes_acked.min(self.smss);
            } else {
                // One increment per RTT, approximated per ACK.
                self.cwnd += (self.smss * self.smss / self.cwnd).max(1);
            }
            NewAck::Open
        } else if seq_leq(ack, self.recover) {
            // Deflate by the bytes acknowledged, then add back one SMSS for
            // the segment that left the network (RFC 6582, step 3.5).
            self.cwnd = self.cwnd.saturating_sub(bytes_acked) + self.smss;
            self.dup_acks = 0;
            let reset_rtx = !self.fpack_seen;
            self.fpack_seen = true;
            NewAck::PartialAck { reset_rtx }
        } else {
            self.dup_acks = 0;
            self.fast_recovery = false;
            self.fpack_seen = false;
            self.cwnd = self.ssthresh.min(flight_size.max(self.smss) + self.smss);
            NewAck::FullAck
        }
    }

    /// A duplicate ACK arrived while SND.UNA stood at `snd_una`.
    pub fn on_dup_ack(&mut self, snd_una: u32, snd_nxt: u32, flight_size: u32) -> DupAck {
        self.dup_acks += 1;
        match self.dup_acks {
            1 | 2 => DupAck::LimitedTransmit,
            3 => {
                // Only enter recovery when the ACK covers more than the
                // previous episode, or the cwnd has grown past one segment
                // without the ACK jumping far (RFC 6582, section 4).
                if seq_gt(snd_una.wrapping_sub(1), self.recover)
                    || (self.cwnd > self.smss
                        && self.highest_ack.wrapping_sub(self.prev_highest_ack) <= 4 * self.smss)
                {
                    self.recover = snd_nxt;
                    self.reduce_ssthresh(flight_size);
                    self.cwnd = self.ssthresh + 3 * self.smss;
                    self.fast_recovery = true;
                    self.fpack_seen = false;
                    DupAck::FastRetransmit
                } else {
                    DupAck::Ignore
                }
            }
            _ => {
                self.cwnd += self.smss;
                DupAck::LimitedTransmit
            }
        }
    }

    /// The retransmission timer fired. `first_attempt` is true when this is
    /// the first expiry of the episode; only that one halves ssthresh.
    pub fn on_rtx_timeout(&mut self, flight_size: u32, snd_nxt: u32, first_attempt: bool) {
        if first_attempt {
            self.reduce_ssthresh(flight_size);
        }
        self.recover = snd_nxt;
        self.fast_recovery = false;
        self.fpack_seen = false;
        self.dup_acks = 0;
        self.cwnd = self.smss;
    }

    /// Whether a limited-transmit segment may be sent (RFC 5681, p. 9).
    pub fn may_limited_transmit(&self, snd_wnd: u32, flight_size: u32) -> bool {
        snd_wnd >= self.smss && flight_size <= self.cwnd + 2 * self.smss
    }

    /// `ssthresh = max(FlightSize / 2, 2*SMSS)` (RFC 5681, equation 4).
    fn reduce_ssthresh(&mut self, flight_size: u32) {
        self.ssthresh = (flight_size / 2).max(2 * self.smss);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMSS: u32 = 1000;

    fn reno() -> Reno {
        Reno::new(SMSS, 65535)
    }

    #[test]
    fn initial_window() {
        assert_eq!(reno().cwnd(), 4000);
        assert_eq!(Reno::new(1460, 65535).cwnd(), 4380);
        assert_eq!(Reno::new(3000, 65535).cwnd(), 6000);
    }

    #[test]
    fn slow_start_grows_by_bytes_acked() {
        let mut reno = reno();
        assert!(reno.in_slow_start());
        let before = reno.cwnd();
        assert_eq!(reno.on_new_ack(2000, 800, 5000, 6000), NewAck::Open);
        assert_eq!(reno.cwnd(), before + 800);
        // Growth per ACK is capped at one SMSS.
        assert_eq!(reno.on_new_ack(4000, 2000, 5000, 6000), NewAck::Open);
        assert_eq!(reno.cwnd(), before + 800 + SMSS);
    }

    #[test]
    fn congestion_avoidance_grows_sublinearly() {
        let mut reno = Reno::new(SMSS, 2000);
        assert!(!reno.in_slow_start());
        let before = reno.cwnd();
        let _ = reno.on_new_ack(2000, 1000, 5000, 6000);
        assert_eq!(reno.cwnd(), before + (SMSS * SMSS / before).max(1));
    }

    #[test]
    fn three_dup_acks_enter_fast_retransmit() {
        // The worked example: SND.UNA = 1000, SND.NXT = 6000, SMSS = 1000.
        let mut reno = reno();
        assert_eq!(reno.on_dup_ack(1000, 6000, 5000), DupAck::LimitedTransmit);
        assert_eq!(reno.on_dup_ack(1000, 6000, 5000), DupAck::LimitedTransmit);
        assert_eq!(reno.on_dup_ack(1000, 6000, 5000), DupAck::FastRetransmit);
        assert_eq!(reno.ssthresh(), 2500);
        assert_eq!(reno.cwnd(), 2500 + 3 * SMSS);
        assert!(reno.in_fast_recovery());
        assert_eq!(reno.recover(), 6000);
    }

    #[test]
    fn later_dup_acks_inflate_the_window() {
        let mut reno = reno();
        for _ in 0..3 {
            let _ = reno.on_dup_ack(1000, 6000, 5000);
        }
        let inflated = reno.cwnd();
        assert_eq!(reno.on_dup_ack(1000, 6000, 5000), DupAck::LimitedTransmit);
        assert_eq!(reno.cwnd(), inflated + SMSS);
    }

    #[test]
    fn partial_ack_stays_in_recovery() {
        let mut reno = reno();
        for _ in 0..3 {
            let _ = reno.on_dup_ack(1000, 6000, 5000);
        }
        let before = reno.cwnd();
        let action = reno.on_new_ack(2000, 1000, 4000, 6000);
        assert_eq!(action, NewAck::PartialAck { reset_rtx: true });
        assert!(reno.in_fast_recovery());
        assert_eq!(reno.cwnd(), before - 1000 + SMSS);
        // Only the first partial ACK of an episode resets the timer.
        assert_eq!(
            reno.on_new_ack(3000, 1000, 3000, 6000),
            NewAck::PartialAck { reset_rtx: false }
        );
    }

    #[test]
    fn full_ack_exits_recovery() {
        let mut reno = reno();
        for _ in 0..3 {
            let _ = reno.on_dup_ack(1000, 6000, 5000);
        }
        assert_eq!(reno.on_new_ack(6001, 5001, 0, 6001), NewAck::FullAck);
        assert!(!reno.in_fast_recovery());
        // cwnd = min(ssthresh, max(flight, SMSS) + SMSS)
        assert_eq!(reno.cwnd(), 2000.min(reno.ssthresh()));
    }

    #[test]
    fn rtx_timeout_collapses_the_window() {
        let mut reno = reno();
        reno.on_rtx_timeout(2000, 3000, true);
        assert_eq!(reno.ssthresh(), 2 * SMSS);
        assert_eq!(reno.cwnd(), SMSS);
        assert_eq!(reno.recover(), 3000);
        assert!(!reno.in_fast_recovery());
        assert_eq!(reno.dup_acks(), 0);
        // A second expiry backs off the timer but leaves ssthresh alone.
        let ssthresh = reno.ssthresh();
        reno.on_rtx_timeout(1000, 3000, false);
        assert_eq!(reno.ssthresh(), ssthresh);
    }

    #[test]
    fn limited_transmit_guards() {
        let reno = reno();
        assert!(reno.may_limited_transmit(10000, reno.cwnd()));
        assert!(!reno.may_limited_transmit(SMSS - 1, 0));
        assert!(!reno.may_limited_transmit(10000, reno.cwnd() + 2 * SMSS + 1));
    }
}
