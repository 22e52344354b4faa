use serde::{Deserialize, Serialize};

use crate::handler::DEFAULT_RETRY_COUNT;

/// Service-wide defaults applied to every handler registered through
/// [`MqService::register_handler`](crate::MqService::register_handler).
///
/// Missing fields take their default values when deserializing, so a host
/// can load a partial configuration from any serde format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Retries allowed after the first attempt.
    pub retry_count: u32,
    /// Response types whose default replies are published. `None` allows all.
    pub publish_responses_whitelist: Option<Vec<String>>,
    /// Message types notified on their out queue. `None` allows all.
    pub publish_to_outq_whitelist: Option<Vec<String>>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            publish_responses_whitelist: None,
            publish_to_outq_whitelist: None,
        }
    }
}

impl ServiceSettings {
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_publish_responses_whitelist(mut self, whitelist: Vec<String>) -> Self {
        self.publish_responses_whitelist = Some(whitelist);
        self
    }

    pub fn with_publish_to_outq_whitelist(mut self, whitelist: Vec<String>) -> Self {
        self.publish_to_outq_whitelist = Some(whitelist);
        self
    }

    /// Never publish default replies. Explicit `reply_to` still works.
    pub fn disable_publishing_responses(self) -> Self {
        self.with_publish_responses_whitelist(Vec::new())
    }

    /// Never notify out queues.
    pub fn disable_publishing_to_outq(self) -> Self {
        self.with_publish_to_outq_whitelist(Vec::new())
    }
}
