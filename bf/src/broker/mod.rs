//! In-process message broker
//!
//! Topic-style named queues with priority ordering. Publishers push
//! messages carrying a 1-10 priority; consumers pop the highest-priority
//! message, FIFO within a priority. A message that fails consumption is
//! redelivered once, then parked on the dead-letter queue.

mod bus;

pub use bus::{Broker, BrokerMessage, QueueDepths};

/// Queue for persisted inbound webhook notifications
pub const WEBHOOKS: &str = "webhooks";

/// Queue the scheduler's workers consume workflow dispatches from
pub const WORKFLOWS: &str = "workflows";

/// Queue for validation outcome notifications
pub const VALIDATIONS: &str = "validations";

/// Queue for messages that repeatedly failed consumption
pub const DEAD_LETTER: &str = "dead-letter";

/// All queues the broker creates at startup
pub const QUEUES: &[&str] = &[WEBHOOKS, WORKFLOWS, VALIDATIONS, DEAD_LETTER];
