//! Dial-out attempts with exponential backoff and jitter.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::info;

use crate::error::Result;
use crate::transport::Transport;
use crate::util::mask_phone;

/// Maximum dial attempts per call.
pub const DIALOUT_MAX_RETRIES: u32 = 3;

/// Backoff base in seconds; doubles per attempt.
const BASE_DELAY_SECS: f64 = 1.0;

/// Uniform jitter bound in seconds, against thundering herds.
const MAX_JITTER_SECS: f64 = 0.5;

/// Tracks dial attempts for one outbound call.
pub struct DialoutManager {
    transport: Arc<dyn Transport>,
    phone_number: String,
    attempt_count: u32,
    connected: bool,
}

impl DialoutManager {
    /// Fresh manager for one number.
    pub fn new(transport: Arc<dyn Transport>, phone_number: impl Into<String>) -> Self {
        Self {
            transport,
            phone_number: phone_number.into(),
            attempt_count: 0,
            connected: false,
        }
    }

    /// Delay before the next attempt: `BASE * 2^(n-1) + U(0, JITTER)`.
    fn calculate_delay(&self) -> Duration {
        let exponent = self.attempt_count.saturating_sub(1);
        let base = BASE_DELAY_SECS * f64::from(1u32 << exponent.min(16));
        let jitter = rand::thread_rng().gen_range(0.0..MAX_JITTER_SECS);
        Duration::from_secs_f64(base + jitter)
    }

    /// Place one attempt. Returns `false` when attempts are exhausted or
    /// the call already connected.
    pub async fn attempt(&mut self) -> Result<bool> {
        if self.attempt_count >= DIALOUT_MAX_RETRIES || self.connected {
            return Ok(false);
        }
        self.attempt_count += 1;
        info!(
            attempt = self.attempt_count,
            max = DIALOUT_MAX_RETRIES,
            phone = %mask_phone(&self.phone_number),
            "dial-out attempt"
        );
        self.transport.start_dialout(&self.phone_number).await?;
        Ok(true)
    }

    /// Sleep the backoff delay, then place the next attempt. Returns
    /// `false` when no attempt was placed.
    pub async fn retry(&mut self) -> Result<bool> {
        if !self.should_retry() {
            return Ok(false);
        }
        let delay = self.calculate_delay();
        info!(
            delay_secs = format!("{:.2}", delay.as_secs_f64()),
            next_attempt = self.attempt_count + 1,
            "retrying dial-out"
        );
        tokio::time::sleep(delay).await;
        self.attempt().await
    }

    /// The call was answered; no further retries.
    pub fn mark_connected(&mut self) {
        self.connected = true;
    }

    /// Whether the call connected.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether another attempt is allowed.
    pub fn should_retry(&self) -> bool {
        self.attempt_count < DIALOUT_MAX_RETRIES && !self.connected
    }

    /// Attempts placed so far.
    pub fn attempts(&self) -> u32 {
        self.attempt_count
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::test_utils::MockTransport;

    #[tokio::test]
    async fn attempts_cap_at_three() {
        let transport = Arc::new(MockTransport::new());
        let mut dialout = DialoutManager::new(transport.clone(), "+15551234567");

        assert!(dialout.attempt().await.unwrap());
        assert!(dialout.attempt().await.unwrap());
        assert!(dialout.attempt().await.unwrap());
        assert!(!dialout.attempt().await.unwrap());
        assert_eq!(transport.dialout_attempts().await.len(), 3);
    }

    #[tokio::test]
    async fn connection_stops_retries() {
        let transport = Arc::new(MockTransport::new());
        let mut dialout = DialoutManager::new(transport, "+15551234567");
        assert!(dialout.attempt().await.unwrap());
        dialout.mark_connected();
        assert!(!dialout.should_retry());
        assert!(!dialout.retry().await.unwrap());
        assert_eq!(dialout.attempts(), 1);
    }

    /// Delay bounds per the backoff formula: 1-1.5 s, 2-2.5 s, 4-4.5 s.
    #[tokio::test]
    async fn delays_fall_in_documented_bounds() {
        let transport = Arc::new(MockTransport::new());
        let mut dialout = DialoutManager::new(transport, "+15551234567");

        let bounds = [(1.0, 1.5), (2.0, 2.5), (4.0, 4.5)];
        for (low, high) in bounds {
            let _ = dialout.attempt().await.unwrap();
            // Sample repeatedly; jitter is uniform in [0, 0.5).
            for _ in 0..50 {
                let delay = dialout.calculate_delay().as_secs_f64();
                assert!(delay >= low, "delay {delay} below {low}");
                assert!(delay < high, "delay {delay} at or above {high}");
            }
        }
    }
}
