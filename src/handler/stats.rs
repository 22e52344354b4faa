use std::fmt;

use chrono::{DateTime, Utc};

/// Queue a message was received from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Priority,
    Normal,
}

/// Per-handler counters.
///
/// Handlers hold their own counters; callers get snapshots. Counters are
/// reset whenever the service rebuilds its handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerStats {
    pub name: String,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    pub total_from_priority_queue: u64,
    pub total_from_normal_queue: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl HandlerStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Messages received from both queues.
    pub fn total_received(&self) -> u64 {
        self.total_from_priority_queue + self.total_from_normal_queue
    }

    /// Fold another snapshot into this one.
    pub fn add(&mut self, other: &HandlerStats) {
        self.total_processed += other.total_processed;
        self.total_failed += other.total_failed;
        self.total_retries += other.total_retries;
        self.total_from_priority_queue += other.total_from_priority_queue;
        self.total_from_normal_queue += other.total_from_normal_queue;
        self.last_processed_at = self.last_processed_at.max(other.last_processed_at);
    }

    pub(crate) fn record_received(&mut self, source: QueueKind) {
        match source {
            QueueKind::Priority => self.total_from_priority_queue += 1,
            QueueKind::Normal => self.total_from_normal_queue += 1,
        }
        self.last_processed_at = Some(Utc::now());
    }
}

impl fmt::Display for HandlerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "STATS for {}:", self.name)?;
        writeln!(f, "  TotalNormalMessagesReceived:   {}", self.total_from_normal_queue)?;
        writeln!(f, "  TotalPriorityMessagesReceived: {}", self.total_from_priority_queue)?;
        writeln!(f, "  TotalProcessed:                {}", self.total_processed)?;
        writeln!(f, "  TotalRetries:                  {}", self.total_retries)?;
        writeln!(f, "  TotalFailed:                   {}", self.total_failed)?;
        match self.last_processed_at {
            Some(at) => writeln!(f, "  LastMessageProcessed:          {}", at.to_rfc3339()),
            None => writeln!(f, "  LastMessageProcessed:          never"),
        }
    }
}
