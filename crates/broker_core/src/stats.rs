use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::MessageType;

/// Running totals kept by the broker's routing path.
#[derive(Debug, Default)]
pub(crate) struct MessageStats {
    total_received: u64,
    total_sent: u64,
    request_count: u64,
    response_count: u64,
    event_count: u64,
    error_count: u64,
    first_message_time: Option<DateTime<Utc>>,
    last_message_time: Option<DateTime<Utc>>,
}

impl MessageStats {
    /// Records one message entering the broker (read from a child or enqueued internally).
    pub fn record_received(&mut self, kind: MessageType) {
        self.total_received += 1;
        match kind {
            MessageType::Request => self.request_count += 1,
            MessageType::Response => self.response_count += 1,
            MessageType::Event => self.event_count += 1,
            MessageType::Error => self.error_count += 1,
        }
        let now = Utc::now();
        self.first_message_time.get_or_insert(now);
        self.last_message_time = Some(now);
    }

    /// Records one message leaving the broker (written to a child or delivered inbound).
    pub fn record_sent(&mut self) {
        self.total_sent += 1;
    }

    pub fn total(&self) -> u64 {
        self.total_received
    }

    pub fn snapshot(&self) -> MessageStatsSnapshot {
        MessageStatsSnapshot {
            total_received: self.total_received,
            total_sent: self.total_sent,
            request_count: self.request_count,
            response_count: self.response_count,
            event_count: self.event_count,
            error_count: self.error_count,
            first_message_time: self.first_message_time,
            last_message_time: self.last_message_time,
        }
    }
}

/// Owned copy of the statistics counters; also the `RPCGetMessageStats` reply shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageStatsSnapshot {
    pub total_sent: u64,
    pub total_received: u64,
    pub request_count: u64,
    pub response_count: u64,
    pub event_count: u64,
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_message_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<DateTime<Utc>>,
}
