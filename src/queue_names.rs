//! Logical queue names per message type.
//!
//! Every message type owns four queues derived from its type identifier:
//!
//! | queue      | name                    | purpose                              |
//! |------------|-------------------------|--------------------------------------|
//! | `normal`   | `mq:{type}.inq`         | regular inbound messages             |
//! | `priority` | `mq:{type}.priorityq`   | drained before `normal`              |
//! | `out`      | `mq:{type}.outq`        | one-way notifications of completions |
//! | `dlq`      | `mq:{type}.dlq`         | dead letters                         |
//!
//! The four suffixes are distinct and none of them ends another, so a queue
//! name identifies both its kind and its type identifier.

use uuid::Uuid;

use crate::Message;

const QUEUE_PREFIX: &str = "mq:";
const TEMP_QUEUE_PREFIX: &str = "mq:tmp:";

const IN_SUFFIX: &str = ".inq";
const PRIORITY_SUFFIX: &str = ".priorityq";
const OUT_SUFFIX: &str = ".outq";
const DLQ_SUFFIX: &str = ".dlq";

/// The four logical queues of one message type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueNames {
    pub normal: String,
    pub priority: String,
    pub out: String,
    pub dlq: String,
}

impl QueueNames {
    /// Derive the queue names of a type identifier.
    pub fn for_type(type_name: &str) -> Self {
        Self {
            normal: format!("{QUEUE_PREFIX}{type_name}{IN_SUFFIX}"),
            priority: format!("{QUEUE_PREFIX}{type_name}{PRIORITY_SUFFIX}"),
            out: format!("{QUEUE_PREFIX}{type_name}{OUT_SUFFIX}"),
            dlq: format!("{QUEUE_PREFIX}{type_name}{DLQ_SUFFIX}"),
        }
    }

    /// Queue names of a message type.
    pub fn of<T: Message>() -> Self {
        Self::for_type(T::TYPE_NAME)
    }

    /// Queues drained by a handler, in drain order.
    pub fn process_queues(&self) -> [&str; 2] {
        [&self.priority, &self.normal]
    }

    /// All four names.
    pub fn all(&self) -> [&str; 4] {
        [&self.normal, &self.priority, &self.out, &self.dlq]
    }

    /// A unique, non-typed queue name for ad-hoc replies.
    pub fn temp_queue_name() -> String {
        format!("{TEMP_QUEUE_PREFIX}{}", Uuid::new_v4())
    }

    pub fn is_temp_queue(queue_name: &str) -> bool {
        queue_name.starts_with(TEMP_QUEUE_PREFIX)
    }
}
