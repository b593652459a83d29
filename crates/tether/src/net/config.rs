use serde::{Deserialize, Serialize};

/// Timing knobs shared by every endpoint. All values are seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub ping_interval_secs: f32,
    pub disconnect_threshold_secs: f32,
    /// Latency assumed before the first ping round trip completes.
    pub initial_latency_secs: f32,
    /// A reliable envelope is resent after `latency * resend_latency_multiplier`.
    pub resend_latency_multiplier: f32,
    pub min_resend_interval_secs: f32,
    /// How long acknowledged digests are remembered to absorb duplicate acks.
    pub ack_history_secs: f32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 1.0,
            disconnect_threshold_secs: 5.0,
            initial_latency_secs: 0.1,
            resend_latency_multiplier: 5.0,
            min_resend_interval_secs: 0.05,
            ack_history_secs: 15.0,
        }
    }
}

impl NetConfig {
    pub fn resend_interval(&self, latency_secs: f32) -> f32 {
        (latency_secs * self.resend_latency_multiplier).max(self.min_resend_interval_secs)
    }
}
