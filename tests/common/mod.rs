#![allow(dead_code)]

use chrono::Duration;
use engagement_ledger::application::Services;
use engagement_ledger::application::engine::{NewRequest, NewReservation};
use engagement_ledger::config::EngineConfig;
use engagement_ledger::domain::engagement::{Address, Engagement, ServiceType};
use engagement_ledger::domain::ledger::TokenPlan;
use engagement_ledger::domain::ports::{Notifier, Stores};
use engagement_ledger::infrastructure::clock::ManualClock;
use engagement_ledger::infrastructure::coverage::FlatCoverage;
use engagement_ledger::infrastructure::registry::ConnectionRegistry;
use rust_decimal_macros::dec;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;

pub const CLIENT: &str = "client-1";
pub const PRO: &str = "pro-1";

pub struct Harness {
    pub services: Services,
    pub clock: ManualClock,
    pub registry: ConnectionRegistry,
}

pub fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

pub fn harness_with(config: EngineConfig) -> Harness {
    harness_from(Stores::in_memory(), None, config)
}

/// Builds on the given stores; `notifier` replaces the connection registry.
pub fn harness_from(
    stores: Stores,
    notifier: Option<Arc<dyn Notifier>>,
    config: EngineConfig,
) -> Harness {
    let clock = ManualClock::default();
    let registry = ConnectionRegistry::new();
    let notifier = notifier.unwrap_or_else(|| Arc::new(registry.clone()));
    let services = Services::new(
        stores,
        notifier,
        Arc::new(FlatCoverage::new(dec!(200), Some(dec!(3.5)))),
        Arc::new(clock.clone()),
        config,
    );
    Harness {
        services,
        clock,
        registry,
    }
}

impl Harness {
    pub async fn professional(&self, plan: TokenPlan) {
        self.services.ledger.open_account(PRO, plan).await.unwrap();
        self.services.ledger.open_free_subscription(PRO).await.unwrap();
    }

    pub async fn reservation(&self, code: &str) -> Engagement {
        self.services
            .engine
            .open_reservation(NewReservation {
                code: Some(code.to_string()),
                client: CLIENT.into(),
                professional: PRO.into(),
                service_type: ServiceType::TechnicalVisit,
                description: "Leaking pipe under the sink".into(),
                address: address(),
                hours: None,
            })
            .await
            .unwrap()
    }

    pub async fn request(&self, code: &str) -> Engagement {
        self.services
            .engine
            .open_request(NewRequest {
                code: Some(code.to_string()),
                client: CLIENT.into(),
                professional: PRO.into(),
                description: "Paint two rooms".into(),
                address: address(),
            })
            .await
            .unwrap()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

pub fn address() -> Address {
    Address::new("Av. Santa Fe 3200", "Palermo", "Buenos Aires")
}

/// Writes an operations file with `jobs` independent request flows, each
/// ending approved by the client.
pub fn generate_operations(path: &Path, jobs: usize) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record(["at", "op", "engagement", "actor", "counterpart", "amount", "detail"])?;
    wtr.write_record(["2025-05-01T08:00:00Z", "account", "", "pro", "", "", "professional"])?;
    wtr.write_record(["2025-05-01T08:00:00Z", "free", "", "pro", "", "", ""])?;

    for i in 1..=jobs {
        let code = format!("SOL-{}", i);
        let rows = [
            ("request", "client", "", "Paint|Calle 1|Once|Buenos Aires"),
            ("contact", "pro", "", "Hi"),
            ("accept", "pro", "", ""),
            ("done", "pro", "", ""),
            ("approve", "client", "1000", ""),
        ];
        for (op, actor, amount, detail) in rows {
            let counterpart = if op == "request" { "pro" } else { "" };
            wtr.write_record([
                "2025-05-01T09:00:00Z",
                op,
                &code,
                actor,
                counterpart,
                amount,
                detail,
            ])?;
        }
    }

    wtr.flush()?;
    Ok(())
}
