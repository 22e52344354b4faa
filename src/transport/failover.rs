use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnect settings for broker-backed transports.
///
/// The in-memory transport has no connection and ignores these settings.
/// A `max_reconnect_attempts` of `0` means reconnecting is retried forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverSettings {
    /// Brokers tried in order, wrapping around.
    pub broker_uris: Vec<String>,
    #[serde(with = "millis")]
    pub initial_reconnect_delay: Duration,
    #[serde(with = "millis")]
    pub max_reconnect_delay: Duration,
    pub use_exponential_back_off: bool,
    pub back_off_multiplier: f64,
    pub max_reconnect_attempts: u32,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            broker_uris: Vec::new(),
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_secs(30),
            use_exponential_back_off: true,
            back_off_multiplier: 2.0,
            max_reconnect_attempts: 0,
        }
    }
}

/// Retry bookkeeping for one reconnect sequence.
///
/// Each call to [`ReconnectBackoff::next_delay`] consumes one attempt and
/// returns how long to wait before it, or `None` once the attempt budget is
/// spent.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    settings: FailoverSettings,
    attempts: u32,
    total_attempts: u64,
    current_delay: Duration,
}

impl ReconnectBackoff {
    pub fn new(settings: FailoverSettings) -> Self {
        let current_delay = settings.initial_reconnect_delay;
        Self {
            settings,
            attempts: 0,
            total_attempts: 0,
            current_delay,
        }
    }

    pub fn settings(&self) -> &FailoverSettings {
        &self.settings
    }

    /// Attempts consumed since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempts consumed over the lifetime of this counter.
    pub fn total_attempts(&self) -> u64 {
        self.total_attempts
    }

    /// Consume one attempt and return the delay to wait before it.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let budget = self.settings.max_reconnect_attempts;
        if budget != 0 && self.attempts >= budget {
            return None;
        }

        let delay = self.current_delay.min(self.settings.max_reconnect_delay);
        self.attempts += 1;
        self.total_attempts += 1;

        if self.settings.use_exponential_back_off {
            self.current_delay = self
                .current_delay
                .mul_f64(self.settings.back_off_multiplier.max(1.0))
                .min(self.settings.max_reconnect_delay);
        }

        Some(delay)
    }

    /// Broker to use for the next connection attempt.
    ///
    /// Rotates through `broker_uris` using the lifetime attempt count.
    pub fn next_broker_uri(&self) -> Option<&str> {
        let uris = &self.settings.broker_uris;
        if uris.is_empty() {
            return None;
        }
        let index = (self.total_attempts % uris.len() as u64) as usize;
        Some(uris[index].as_str())
    }

    /// Start a new reconnect sequence after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.settings.initial_reconnect_delay;
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> FailoverSettings {
        FailoverSettings {
            broker_uris: vec!["tcp://a:61616".into(), "tcp://b:61616".into()],
            initial_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_millis(500),
            use_exponential_back_off: true,
            back_off_multiplier: 2.0,
            max_reconnect_attempts: 5,
        }
    }

    #[test]
    fn delays_grow_exponentially_up_to_the_cap() {
        let mut backoff = ReconnectBackoff::new(settings());

        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn zero_attempts_means_unlimited() {
        let mut backoff = ReconnectBackoff::new(FailoverSettings {
            max_reconnect_attempts: 0,
            ..settings()
        });

        for _ in 0..1_000 {
            assert!(backoff.next_delay().is_some());
        }
    }

    #[test]
    fn constant_delay_without_back_off() {
        let mut backoff = ReconnectBackoff::new(FailoverSettings {
            use_exponential_back_off: false,
            ..settings()
        });

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn brokers_rotate_and_reset_restores_budget() {
        let mut backoff = ReconnectBackoff::new(settings());

        assert_eq!(backoff.next_broker_uri(), Some("tcp://a:61616"));
        backoff.next_delay();
        assert_eq!(backoff.next_broker_uri(), Some("tcp://b:61616"));
        backoff.next_delay();
        assert_eq!(backoff.next_broker_uri(), Some("tcp://a:61616"));

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.total_attempts(), 2);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let parsed: FailoverSettings =
            serde_json::from_str(r#"{"broker_uris":["tcp://x"],"max_reconnect_delay":1000}"#)
                .unwrap();

        assert_eq!(parsed.broker_uris, vec!["tcp://x".to_owned()]);
        assert_eq!(parsed.max_reconnect_delay, Duration::from_secs(1));
        assert_eq!(parsed.initial_reconnect_delay, Duration::from_millis(10));
        assert_eq!(parsed.max_reconnect_attempts, 0);
    }
}
