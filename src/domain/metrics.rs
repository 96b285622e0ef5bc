use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::engagement::UserId;

/// One entry of an engagement's message thread. Never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub engagement: String,
    pub sender: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Running response-time statistics of a professional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetrics {
    pub professional: UserId,
    pub average_minutes: i64,
    pub samples: u64,
    pub fast_responder: bool,
}

impl ResponseMetrics {
    pub fn new(professional: impl Into<UserId>) -> Self {
        Self {
            professional: professional.into(),
            average_minutes: 0,
            samples: 0,
            fast_responder: false,
        }
    }

    /// Folds one sample into the running average.
    pub fn record(&mut self, sample_minutes: i64, fast_threshold: i64) {
        self.average_minutes = if self.samples == 0 {
            sample_minutes
        } else {
            let count = self.samples as i64;
            round_div(self.average_minutes * count + sample_minutes, count + 1)
        };
        self.samples += 1;
        self.fast_responder = self.average_minutes <= fast_threshold;
    }

    pub fn from_samples(
        professional: impl Into<UserId>,
        samples: impl IntoIterator<Item = i64>,
        fast_threshold: i64,
    ) -> Self {
        let mut metrics = Self::new(professional);
        for sample in samples {
            metrics.record(sample, fast_threshold);
        }
        metrics
    }
}

// Half-up for non-negative operands.
fn round_div(num: i64, den: i64) -> i64 {
    (2 * num + den) / (2 * den)
}

/// Minutes between two instants, rounded and floored at zero.
pub fn response_gap_minutes(asked_at: DateTime<Utc>, replied_at: DateTime<Utc>) -> i64 {
    let secs = (replied_at - asked_at).num_seconds();
    if secs <= 0 { 0 } else { (secs + 30) / 60 }
}

/// Latest message before `reply` in the same thread that was sent by someone
/// other than the replier. `thread` must be in send order.
pub fn preceding_counterpart_message<'a>(
    thread: &'a [Message],
    reply: &Message,
) -> Option<&'a Message> {
    thread
        .iter()
        .rev()
        .filter(|m| m.engagement == reply.engagement)
        .filter(|m| m.sent_at <= reply.sent_at)
        .find(|m| m.sender != reply.sender)
}

/// `(replied_at, gap)` for every reply `professional` sent across `thread`,
/// skipping gaps longer than `max_gap_minutes`.
pub fn response_samples(
    thread: &[Message],
    professional: &str,
    max_gap_minutes: i64,
) -> Vec<(DateTime<Utc>, i64)> {
    thread
        .iter()
        .enumerate()
        .filter(|(_, m)| m.sender == professional)
        .filter_map(|(idx, reply)| {
            preceding_counterpart_message(&thread[..idx], reply)
                .map(|prev| (reply.sent_at, response_gap_minutes(prev.sent_at, reply.sent_at)))
        })
        .filter(|(_, gap)| *gap <= max_gap_minutes)
        .collect()
}
