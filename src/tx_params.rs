//! Confirmable-message retransmission timing (RFC 7252 §4.8, §4.2).
//!
//! Grounded directly on `tx_params.h`'s formulas: a validating
//! constructor in place of the original's `_anjay_coap_tx_params_valid`
//! out-parameter, and `exchange_lifetime`/`max_transmit_span`/
//! `max_transmit_wait` as methods rather than free functions taking a
//! struct pointer.

use crate::error::ConfigError;
use crate::id_source::Rng;

/// Maximum time a client will wait for a Separate Response before giving
/// up (RFC 7252 doesn't mandate a number; this mirrors the original's
/// 30 second constant).
pub const SEPARATE_RESPONSE_TIMEOUT_MS: u32 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransmissionParams {
    pub ack_timeout_ms: u32,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
}

impl TransmissionParams {
    /// RFC 7252 defaults: `ACK_TIMEOUT=2s`, `ACK_RANDOM_FACTOR=1.5`,
    /// `MAX_RETRANSMIT=4`.
    pub fn new(
        ack_timeout_ms: u32,
        ack_random_factor: f64,
        max_retransmit: u32,
    ) -> Result<Self, ConfigError> {
        // ACK_TIMEOUT below 1 second would violate the guidelines of
        // RFC 5405 (RFC 7252 §4.8.1).
        if ack_timeout_ms < 1000 {
            return Err(ConfigError::AckTimeoutTooSmall);
        }
        // ACK_RANDOM_FACTOR must not be decreased below 1.0 (ibid.).
        if ack_random_factor <= 1.0 {
            return Err(ConfigError::AckRandomFactorTooSmall);
        }
        Ok(TransmissionParams {
            ack_timeout_ms,
            ack_random_factor,
            max_retransmit,
        })
    }

    /// Shorter timeouts, no retransmissions: the profile this engine
    /// uses over SMS transports, where the bearer itself already
    /// guarantees delivery or reports failure.
    pub fn sms_profile() -> Self {
        TransmissionParams {
            ack_timeout_ms: 62_000,
            ack_random_factor: 1.5,
            max_retransmit: 0,
        }
    }

    pub fn max_transmit_wait_ms(&self) -> u32 {
        (self.ack_timeout_ms as f64
            * ((1u64 << (self.max_retransmit + 1)) - 1) as f64
            * self.ack_random_factor) as u32
    }

    pub fn exchange_lifetime_ms(&self) -> u32 {
        (self.ack_timeout_ms as f64
            * (((1u64 << self.max_retransmit) - 1) as f64 * self.ack_random_factor + 1.0))
            as u32
            + 200_000
    }

    pub fn max_transmit_span_ms(&self) -> u32 {
        (self.ack_timeout_ms as f64
            * ((1u64 << self.max_retransmit) - 1) as f64
            * self.ack_random_factor) as u32
    }
}

impl Default for TransmissionParams {
    fn default() -> Self {
        TransmissionParams {
            ack_timeout_ms: 2000,
            ack_random_factor: 1.5,
            max_retransmit: 4,
        }
    }
}

/// Tracks how many times a Confirmable message has been (re)sent and
/// what the next receive timeout should be.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryState {
    pub retry_count: u32,
    pub recv_timeout_ms: u32,
}

impl RetryState {
    /// The state before the first send: no retries yet, timeout for the
    /// first wait randomized in `[ack_timeout_ms, ack_timeout_ms *
    /// ack_random_factor)`.
    pub fn initial(params: &TransmissionParams, rng: &mut impl Rng) -> Self {
        RetryState {
            retry_count: 0,
            recv_timeout_ms: randomized_timeout(params.ack_timeout_ms, params.ack_random_factor, rng),
        }
    }

    /// Whether another retransmission is still allowed.
    pub fn can_retry(&self, params: &TransmissionParams) -> bool {
        self.retry_count < params.max_retransmit
    }

    /// Advances to the next retry: doubles the base timeout (standard
    /// CoAP binary backoff) and randomizes it again.
    pub fn advance(&self, params: &TransmissionParams, rng: &mut impl Rng) -> Self {
        let base = params.ack_timeout_ms << (self.retry_count + 1).min(31);
        RetryState {
            retry_count: self.retry_count + 1,
            recv_timeout_ms: randomized_timeout(base, params.ack_random_factor, rng),
        }
    }
}

fn randomized_timeout(base_ms: u32, ack_random_factor: f64, rng: &mut impl Rng) -> u32 {
    let span = (base_ms as f64 * (ack_random_factor - 1.0)) as u32;
    if span == 0 {
        return base_ms;
    }
    base_ms + rng.next_u32() % span
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::id_source::XorShiftRng;

    #[test]
    fn defaults_match_rfc_7252() {
        let p = TransmissionParams::default();
        assert_eq!(p.max_transmit_span_ms(), 45_000);
        assert_eq!(p.exchange_lifetime_ms(), 247_000);
        assert_eq!(p.max_transmit_wait_ms(), 93_000);
    }

    #[test]
    fn sms_profile_has_no_retransmits() {
        let p = TransmissionParams::sms_profile();
        assert_eq!(p.max_retransmit, 0);
        assert_eq!(p.max_transmit_span_ms(), 0);
    }

    #[test]
    fn rejects_too_small_ack_timeout() {
        assert_eq!(
            TransmissionParams::new(999, 1.5, 4).unwrap_err(),
            ConfigError::AckTimeoutTooSmall
        );
    }

    #[test]
    fn rejects_ack_random_factor_at_or_below_one() {
        assert_eq!(
            TransmissionParams::new(2000, 1.0, 4).unwrap_err(),
            ConfigError::AckRandomFactorTooSmall
        );
    }

    #[test]
    fn retry_state_stops_at_max_retransmit() {
        let params = TransmissionParams::default();
        let mut rng = XorShiftRng::new(7);
        let mut state = RetryState::initial(&params, &mut rng);
        let mut retries = 0;
        while state.can_retry(&params) {
            state = state.advance(&params, &mut rng);
            retries += 1;
        }
        assert_eq!(retries, params.max_retransmit);
    }
}
