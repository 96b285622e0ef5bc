use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

use crate::domain::disclosure::disclosure_level;
use crate::domain::engagement::Engagement;
use crate::domain::ledger::LedgerAccount;
use crate::error::Result;

#[derive(Serialize)]
struct EngagementRow<'a> {
    engagement: &'a str,
    kind: &'static str,
    state: &'static str,
    disclosure: &'static str,
    charged: Option<Decimal>,
}

#[derive(Serialize)]
struct LedgerRow<'a> {
    account: &'a str,
    plan: &'static str,
    available: u32,
    entries: usize,
}

/// Writes the final state: one engagements table, a blank line, one ledgers table.
pub struct SnapshotWriter<W: Write> {
    out: W,
}

impl<W: Write> SnapshotWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write(&mut self, engagements: &[Engagement], ledgers: &[LedgerAccount]) -> Result<()> {
        {
            let mut writer = csv::Writer::from_writer(&mut self.out);
            if engagements.is_empty() {
                writer.write_record(["engagement", "kind", "state", "disclosure", "charged"])?;
            }
            for engagement in engagements {
                writer.serialize(EngagementRow {
                    engagement: &engagement.code,
                    kind: engagement.kind.as_str(),
                    state: engagement.state.as_str(),
                    disclosure: disclosure_level(engagement.kind, engagement.state).as_str(),
                    charged: engagement.costs.charged_amount,
                })?;
            }
            writer.flush()?;
        }
        writeln!(self.out)?;
        {
            let mut writer = csv::Writer::from_writer(&mut self.out);
            if ledgers.is_empty() {
                writer.write_record(["account", "plan", "available", "entries"])?;
            }
            for account in ledgers {
                writer.serialize(LedgerRow {
                    account: &account.professional,
                    plan: account.plan.as_str(),
                    available: account.available,
                    entries: account.history.len(),
                })?;
            }
            writer.flush()?;
        }
        self.out.flush()?;
        Ok(())
    }
}
