//! Buffering configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::BufferingSource`]'s look-ahead window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BufferingConfig {
    /// Look-ahead window in samples (default: 48000, one second at 48 kHz).
    /// A window no larger than the negotiated block size disables buffering
    /// and reads pass straight through.
    pub read_ahead: usize,
    /// Channels kept in the window (default: 2). Destination channels beyond
    /// this come out silent.
    pub channels: usize,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            read_ahead: 48_000,
            channels: 2,
        }
    }
}

impl BufferingConfig {
    /// Config with a look-ahead of `seconds` at `sample_rate`.
    pub fn with_read_ahead_seconds(seconds: f64, sample_rate: f64) -> Self {
        Self {
            read_ahead: ((seconds * sample_rate) as usize).max(1024),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BufferingConfig::default();
        assert_eq!(config.read_ahead, 48_000);
        assert_eq!(config.channels, 2);
    }

    #[test]
    fn test_read_ahead_seconds() {
        let config = BufferingConfig::with_read_ahead_seconds(0.5, 48000.0);
        assert_eq!(config.read_ahead, 24_000);

        // Tiny windows are clamped to something useful.
        let config = BufferingConfig::with_read_ahead_seconds(0.001, 8000.0);
        assert_eq!(config.read_ahead, 1024);
    }
}
