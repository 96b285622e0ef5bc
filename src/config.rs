use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::engagement::{EngagementKind, ServiceType};
use crate::error::{EngineError, Result};

/// What to tell the payment provider when a webhook references nothing we know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownReferencePolicy {
    /// Answer success-shaped so the provider stops retrying.
    #[default]
    Acknowledge,
    /// Surface `NotFound` so the provider retries.
    Reject,
}

impl FromStr for UnknownReferencePolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "acknowledge" | "ack" => Ok(Self::Acknowledge),
            "reject" => Ok(Self::Reject),
            other => Err(EngineError::Config(format!(
                "unknown reference policy must be 'acknowledge' or 'reject', got '{}'",
                other
            ))),
        }
    }
}

/// Prices used to quote a reservation.
#[derive(Debug, Clone, PartialEq)]
pub struct RateCard {
    pub hourly: Decimal,
    pub technical_visit: Decimal,
    pub emergency: Decimal,
    pub default_hours: Decimal,
}

impl Default for RateCard {
    fn default() -> Self {
        Self {
            hourly: dec!(500),
            technical_visit: dec!(1000),
            emergency: dec!(2000),
            default_hours: dec!(2),
        }
    }
}

impl RateCard {
    pub fn subtotal(&self, service_type: ServiceType, hours: Option<Decimal>) -> Decimal {
        match service_type {
            ServiceType::Hourly => self.hourly * hours.unwrap_or(self.default_hours),
            ServiceType::TechnicalVisit => self.technical_visit,
            ServiceType::Emergency => self.emergency,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub reservation_confirm_window: chrono::Duration,
    pub request_confirm_window: chrono::Duration,
    pub sweep_interval: Duration,
    pub notify_timeout: Duration,
    pub fast_responder_minutes: i64,
    pub max_response_gap_minutes: i64,
    pub unknown_reference: UnknownReferencePolicy,
    pub refund_on_cancel: bool,
    pub rates: RateCard,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_confirm_window: chrono::Duration::hours(168),
            request_confirm_window: chrono::Duration::hours(24),
            sweep_interval: Duration::from_secs(3600),
            notify_timeout: Duration::from_millis(5000),
            fast_responder_minutes: 30,
            max_response_gap_minutes: 1440,
            unknown_reference: UnknownReferencePolicy::Acknowledge,
            refund_on_cancel: false,
            rates: RateCard::default(),
        }
    }
}

impl EngineConfig {
    /// Loads `.env` if present, then reads `ENGAGEMENT_*` variables over the defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(hours) = parse::<i64, _>(&lookup, "ENGAGEMENT_RESERVATION_CONFIRM_HOURS")? {
            config.reservation_confirm_window = positive_hours(hours)?;
        }
        if let Some(hours) = parse::<i64, _>(&lookup, "ENGAGEMENT_REQUEST_CONFIRM_HOURS")? {
            config.request_confirm_window = positive_hours(hours)?;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "ENGAGEMENT_SWEEP_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(EngineError::Config(
                    "ENGAGEMENT_SWEEP_INTERVAL_SECS must be greater than zero".to_string(),
                ));
            }
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "ENGAGEMENT_NOTIFY_TIMEOUT_MS")? {
            config.notify_timeout = Duration::from_millis(ms);
        }
        if let Some(minutes) = parse(&lookup, "ENGAGEMENT_FAST_RESPONDER_MINUTES")? {
            config.fast_responder_minutes = minutes;
        }
        if let Some(minutes) = parse(&lookup, "ENGAGEMENT_MAX_RESPONSE_GAP_MINUTES")? {
            config.max_response_gap_minutes = minutes;
        }
        if let Some(policy) = lookup("ENGAGEMENT_UNKNOWN_REFERENCE") {
            config.unknown_reference = policy.parse()?;
        }
        if let Some(flag) = parse(&lookup, "ENGAGEMENT_REFUND_ON_CANCEL")? {
            config.refund_on_cancel = flag;
        }
        if let Some(rate) = parse(&lookup, "ENGAGEMENT_HOURLY_RATE")? {
            config.rates.hourly = rate;
        }
        if let Some(rate) = parse(&lookup, "ENGAGEMENT_TECHNICAL_VISIT_RATE")? {
            config.rates.technical_visit = rate;
        }
        if let Some(rate) = parse(&lookup, "ENGAGEMENT_EMERGENCY_RATE")? {
            config.rates.emergency = rate;
        }

        Ok(config)
    }

    pub fn confirm_window(&self, kind: EngagementKind) -> chrono::Duration {
        match kind {
            EngagementKind::Reservation => self.reservation_confirm_window,
            EngagementKind::Request => self.request_confirm_window,
        }
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| EngineError::Config(format!("{}: {}", key, e))),
    }
}

fn positive_hours(hours: i64) -> Result<chrono::Duration> {
    if hours <= 0 {
        return Err(EngineError::Config(
            "confirmation windows must be at least one hour".to_string(),
        ));
    }
    Ok(chrono::Duration::hours(hours))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(
            config.confirm_window(EngagementKind::Reservation),
            chrono::Duration::days(7)
        );
        assert_eq!(config.unknown_reference, UnknownReferencePolicy::Acknowledge);
        assert!(!config.refund_on_cancel);
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("ENGAGEMENT_REQUEST_CONFIRM_HOURS", "48"),
            ("ENGAGEMENT_UNKNOWN_REFERENCE", "reject"),
            ("ENGAGEMENT_REFUND_ON_CANCEL", "true"),
            ("ENGAGEMENT_HOURLY_RATE", "650.50"),
        ]))
        .unwrap();
        assert_eq!(config.request_confirm_window, chrono::Duration::hours(48));
        assert_eq!(config.unknown_reference, UnknownReferencePolicy::Reject);
        assert!(config.refund_on_cancel);
        assert_eq!(config.rates.hourly, dec!(650.50));
    }

    #[test]
    fn test_invalid_values() {
        for pairs in [
            [("ENGAGEMENT_SWEEP_INTERVAL_SECS", "soon")],
            [("ENGAGEMENT_SWEEP_INTERVAL_SECS", "0")],
            [("ENGAGEMENT_UNKNOWN_REFERENCE", "ignore")],
            [("ENGAGEMENT_RESERVATION_CONFIRM_HOURS", "-1")],
        ] {
            let result = EngineConfig::from_lookup(lookup(&pairs));
            assert!(matches!(result, Err(EngineError::Config(_))), "{:?}", pairs);
        }
    }

    #[test]
    fn test_rate_card_quotes() {
        let rates = RateCard::default();
        assert_eq!(rates.subtotal(ServiceType::Hourly, None), dec!(1000));
        assert_eq!(rates.subtotal(ServiceType::Hourly, Some(dec!(3))), dec!(1500));
        assert_eq!(rates.subtotal(ServiceType::Emergency, Some(dec!(3))), dec!(2000));
    }
}
