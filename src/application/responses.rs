use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use super::locks::KeyedLocks;
use crate::config::EngineConfig;
use crate::domain::engagement::Party;
use crate::domain::metrics::{
    Message, ResponseMetrics, preceding_counterpart_message, response_gap_minutes,
    response_samples,
};
use crate::domain::ports::{Clock, Stores};
use crate::error::{EngineError, Result};

/// Keeps each professional's response-time average up to date as messages arrive.
pub struct ResponseTracker {
    stores: Stores,
    clock: Arc<dyn Clock>,
    fast_threshold: i64,
    max_gap: i64,
    locks: KeyedLocks,
}

impl ResponseTracker {
    pub fn new(stores: Stores, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        Self {
            stores,
            clock,
            fast_threshold: config.fast_responder_minutes,
            max_gap: config.max_response_gap_minutes,
            locks: KeyedLocks::new(),
        }
    }

    /// Appends a message to the engagement's thread. A reply from the
    /// professional folds the response gap into their metrics.
    pub async fn post_message(&self, code: &str, sender: &str, body: &str) -> Result<Message> {
        let engagement = self
            .stores
            .engagements
            .get(code)
            .await?
            .ok_or_else(|| EngineError::not_found("engagement", code))?;
        let party = engagement.party_of(sender).ok_or_else(|| {
            EngineError::Forbidden(format!("{} is not a party to {}", sender, code))
        })?;
        if body.trim().is_empty() {
            return Err(EngineError::ValidationError(
                "A message cannot be empty".to_string(),
            ));
        }

        let message = Message {
            engagement: code.to_string(),
            sender: sender.to_string(),
            body: body.to_string(),
            sent_at: self.clock.now(),
        };
        self.stores.messages.append(message.clone()).await?;

        if party == Party::Professional {
            self.record_reply(&message).await?;
        }
        Ok(message)
    }

    async fn record_reply(&self, reply: &Message) -> Result<()> {
        let thread = self.stores.messages.thread(&reply.engagement).await?;
        let earlier: Vec<Message> = thread
            .into_iter()
            .filter(|m| m.sent_at <= reply.sent_at && m != reply)
            .collect();
        let Some(asked) = preceding_counterpart_message(&earlier, reply) else {
            return Ok(());
        };

        let gap = response_gap_minutes(asked.sent_at, reply.sent_at);
        if gap > self.max_gap {
            debug!(engagement = %reply.engagement, gap, "Response gap too long, not counted");
            return Ok(());
        }

        let _guard = self.locks.lock(&reply.sender).await;
        let mut metrics = self
            .stores
            .metrics
            .get(&reply.sender)
            .await?
            .unwrap_or_else(|| ResponseMetrics::new(reply.sender.clone()));
        metrics.record(gap, self.fast_threshold);
        debug!(
            professional = %reply.sender,
            gap,
            average = metrics.average_minutes,
            fast = metrics.fast_responder,
            "Recorded response time"
        );
        self.stores.metrics.store(metrics).await
    }

    pub async fn metrics(&self, professional: &str) -> Result<Option<ResponseMetrics>> {
        self.stores.metrics.get(professional).await
    }

    /// Recomputes every professional's metrics from the full message history.
    /// Returns the number of professionals written.
    pub async fn rebuild_response_metrics(&self) -> Result<usize> {
        let messages = self.stores.messages.get_all().await?;
        let mut threads: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        for message in messages {
            threads
                .entry(message.engagement.clone())
                .or_default()
                .push(message);
        }

        let mut samples: HashMap<String, Vec<(DateTime<Utc>, i64)>> = HashMap::new();
        for (code, mut thread) in threads {
            let Some(engagement) = self.stores.engagements.get(&code).await? else {
                continue;
            };
            thread.sort_by_key(|m| m.sent_at);
            samples
                .entry(engagement.professional.clone())
                .or_default()
                .extend(response_samples(&thread, &engagement.professional, self.max_gap));
        }

        let count = samples.len();
        for (professional, mut timed) in samples {
            timed.sort_by_key(|(at, _)| *at);
            let metrics = ResponseMetrics::from_samples(
                professional,
                timed.into_iter().map(|(_, gap)| gap),
                self.fast_threshold,
            );
            self.stores.metrics.store(metrics).await?;
        }
        info!(professionals = count, "Rebuilt response metrics");
        Ok(count)
    }
}
