use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Account,
    Free,
    Reservation,
    Request,
    Contact,
    Accept,
    Done,
    Approve,
    Correct,
    Cancel,
    Message,
    Checkout,
    Webhook,
    Sweep,
}

/// One row of an operations file.
///
/// Column meaning depends on `op`; see the replay module for the mapping.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OperationRecord {
    pub at: Option<DateTime<Utc>>,
    pub op: OperationKind,
    pub engagement: Option<String>,
    pub actor: Option<String>,
    pub counterpart: Option<String>,
    pub amount: Option<Decimal>,
    pub detail: Option<String>,
}

impl OperationRecord {
    pub fn engagement(&self) -> Result<&str> {
        required(&self.engagement, "engagement")
    }

    pub fn actor(&self) -> Result<&str> {
        required(&self.actor, "actor")
    }

    pub fn counterpart(&self) -> Result<&str> {
        required(&self.counterpart, "counterpart")
    }

    pub fn detail(&self) -> &str {
        self.detail.as_deref().unwrap_or("")
    }

    /// `detail` split on `|`, padded with empty strings to `n` fields.
    pub fn detail_fields(&self, n: usize) -> Vec<&str> {
        let mut fields: Vec<&str> = self.detail().split('|').map(str::trim).collect();
        fields.resize(n.max(fields.len()), "");
        fields
    }
}

fn required<'a>(value: &'a Option<String>, column: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngineError::ValidationError(format!("column '{}' is required", column)))
}

/// Reads operations from a CSV source.
///
/// Wraps `csv::Reader` with whitespace trimming and flexible record lengths,
/// so trailing empty columns may be omitted.
pub struct OperationReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> OperationReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes rows, so a file is streamed rather than loaded.
    pub fn operations(self) -> impl Iterator<Item = Result<OperationRecord>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(EngineError::from))
    }
}
