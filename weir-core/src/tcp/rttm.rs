//! Round-trip time measurement and the retransmission timeout, as described
//! in [RFC 6298](https://www.rfc-editor.org/rfc/rfc6298.html).

use super::seq::seq_geq;
use std::time::Duration;

const RTO_MIN: Duration = Duration::from_secs(1);
const RTO_MAX: Duration = Duration::from_secs(60);

/// The RTO to fall back to once the handshake completes, when the only
/// samples so far came from SYN exchanges (RFC 6298 5.7).
pub const RTO_AFTER_SYN_RTX: Duration = Duration::from_secs(3);

const ALPHA: f64 = 1.0 / 8.0;
const BETA: f64 = 1.0 / 4.0;

/// Karn/Partridge round-trip measurement with the RFC 6298 smoothing and
/// back-off rules. One measurement is in flight at a time: [`start`] arms it
/// when new data is sent, [`ack`] completes it, and a retransmission
/// discards it so that ambiguous samples never feed the estimator.
///
/// [`start`]: RoundTripTimer::start
/// [`ack`]: RoundTripTimer::ack
#[derive(Debug, Clone, Copy)]
pub struct RoundTripTimer {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    /// The sequence number and start time of the segment being timed.
    sample: Option<(u32, Duration)>,
}

impl Default for RoundTripTimer {
    fn default() -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            // Until a round-trip time measurement has been made, RTO <- 1
            // second (2.1). The RFC's suggested initial value is lower than
            // classic BSD but we keep the conservative clamp below anyway.
            rto: RTO_MIN,
            sample: None,
        }
    }
}

impl RoundTripTimer {
    /// The current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Whether a measurement is in progress.
    pub fn active(&self) -> bool {
        self.sample.is_some()
    }

    /// Begins timing the segment whose last byte is `end_seq`, if no
    /// measurement is already in progress. `now` is the connection's
    /// monotonic clock.
    pub fn start(&mut self, end_seq: u32, now: Duration) {
        if self.sample.is_none() {
            self.sample = Some((end_seq, now));
        }
    }

    /// Completes the measurement if `ack` covers the timed segment.
    pub fn ack(&mut self, ack: u32, now: Duration) {
        if let Some((end_seq, sent_at)) = self.sample {
            if seq_geq(ack, end_seq) {
                self.measure(now.saturating_sub(sent_at));
                self.sample = None;
            }
        }
    }

    /// Discards the in-progress measurement. Karn's algorithm: a segment
    /// that was retransmitted cannot produce an unambiguous sample.
    pub fn invalidate(&mut self) {
        self.sample = None;
    }

    /// Doubles the RTO ("back off the timer", 5.5), bounded above.
    pub fn back_off(&mut self) {
        self.rto = (self.rto * 2).min(RTO_MAX);
    }

    /// Overrides the RTO. Used for the three-second floor after a SYN
    /// retransmission (5.7).
    pub fn set_rto(&mut self, rto: Duration) {
        self.rto = rto.clamp(RTO_MIN, RTO_MAX);
    }

    /// Folds one measurement into SRTT/RTTVAR and recomputes the RTO (2.2
    /// and 2.3).
    fn measure(&mut self, m: Duration) {
        let srtt = match self.srtt {
            None => {
                self.rttvar = m / 2;
                m
            }
            Some(srtt) => {
                let err = if srtt > m { srtt - m } else { m - srtt };
                self.rttvar = mix(self.rttvar, err, BETA);
                mix(srtt, m, ALPHA)
            }
        };
        self.srtt = Some(srtt);
        self.rto = (srtt + 4 * self.rttvar).clamp(RTO_MIN, RTO_MAX);
    }
}

fn mix(old: Duration, new: Duration, weight: f64) -> Duration {
    old.mul_f64(1.0 - weight) + new.mul_f64(weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampled(timer: &mut RoundTripTimer, m: Duration) {
        timer.start(100, Duration::ZERO);
        timer.ack(100, m);
    }

    #[test]
    fn first_sample_initializes_the_estimator() {
        let mut timer = RoundTripTimer::default();
        sampled(&mut timer, Duration::from_millis(500));
        // SRTT = 500ms, RTTVAR = 250ms, RTO = 1500ms.
        assert_eq!(timer.rto(), Duration::from_millis(1500));
    }

    #[test]
    fn rto_is_clamped_below() {
        let mut timer = RoundTripTimer::default();
        sampled(&mut timer, Duration::from_millis(10));
        assert_eq!(timer.rto(), RTO_MIN);
    }

    #[test]
    fn smoothing_follows_the_rfc_weights() {
        let mut timer = RoundTripTimer::default();
        sampled(&mut timer, Duration::from_millis(400));
        timer.start(200, Duration::ZERO);
        timer.ack(200, Duration::from_millis(800));
        // RTTVAR = 3/4*250 + 1/4*|400-800| = 287.5ms
        // SRTT = 7/8*400 + 1/8*800 = 450ms, RTO = 450 + 1150 = 1600ms
        assert_eq!(timer.rto(), Duration::from_millis(1600));
    }

    #[test]
    fn back_off_doubles_and_saturates() {
        let mut timer = RoundTripTimer::default();
        assert_eq!(timer.rto(), RTO_MIN);
        timer.back_off();
        assert_eq!(timer.rto(), Duration::from_secs(2));
        for _ in 0..10 {
            timer.back_off();
        }
        assert_eq!(timer.rto(), RTO_MAX);
    }

    #[test]
    fn partial_ack_does_not_complete_the_sample() {
        let mut timer = RoundTripTimer::default();
        timer.start(1000, Duration::ZERO);
        timer.ack(500, Duration::from_millis(100));
        assert!(timer.active());
        timer.ack(1000, Duration::from_millis(200));
        assert!(!timer.active());
    }

    #[test]
    fn invalidated_sample_never_measures() {
        let mut timer = RoundTripTimer::default();
        timer.start(1000, Duration::ZERO);
        timer.invalidate();
        timer.ack(1000, Duration::from_secs(5));
        assert_eq!(timer.rto(), RTO_MIN);
    }

    #[test]
    fn only_one_measurement_at_a_time() {
        let mut timer = RoundTripTimer::default();
        timer.start(100, Duration::ZERO);
        // A later send must not restart the clock.
        timer.start(200, Duration::from_millis(900));
        timer.ack(100, Duration::from_millis(1000));
        assert_eq!(timer.rto(), Duration::from_secs(3));
    }
}
