//! Drives [`Services`] from operation rows.
//!
//! | op | engagement | actor | counterpart | amount | detail |
//! |---|---|---|---|---|---|
//! | `account` | | professional | | | token plan |
//! | `free` | | user | | | |
//! | `reservation` | code | client | professional | hours | `service\|description\|street\|neighborhood\|city` |
//! | `request` | code | client | professional | | `description\|street\|neighborhood\|city` |
//! | `contact` | code | professional | | | reply |
//! | `accept` | code | professional | | | |
//! | `done` | code | professional | | | notes |
//! | `approve` | code | client or `system` | | charged amount | |
//! | `correct` | code | client | | | description |
//! | `cancel` | code | any party or `system` | | | reason |
//! | `message` | code | sender | | | body |
//! | `checkout` | payment id | user | | | plan |
//! | `webhook` | external reference | | provider payment id | | status |
//! | `sweep` | | | | | |

use tracing::{debug, info};

use crate::application::Services;
use crate::application::engine::{NewRequest, NewReservation};
use crate::domain::engagement::{Address, ServiceType};
use crate::domain::ledger::TokenPlan;
use crate::domain::payment::WebhookPayload;
use crate::domain::subscription::Plan;
use crate::domain::transition::{Actor, Event};
use crate::error::Result;
use crate::infrastructure::clock::ManualClock;
use crate::interfaces::csv::operation_reader::{OperationKind, OperationRecord};

fn actor(id: &str) -> Actor {
    if id == "system" {
        Actor::System
    } else {
        Actor::user(id)
    }
}

fn optional(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}

/// Applies one row. The row's timestamp, if any, moves `clock` first.
pub async fn execute(services: &Services, clock: &ManualClock, record: OperationRecord) -> Result<()> {
    if let Some(at) = record.at {
        clock.set(at);
    }

    match record.op {
        OperationKind::Account => {
            let plan: TokenPlan = record.detail().parse()?;
            services.ledger.open_account(record.actor()?, plan).await?;
        }
        OperationKind::Free => {
            services.ledger.open_free_subscription(record.actor()?).await?;
        }
        OperationKind::Reservation => {
            let fields = record.detail_fields(5);
            services
                .engine
                .open_reservation(NewReservation {
                    code: Some(record.engagement()?.to_string()),
                    client: record.actor()?.to_string(),
                    professional: record.counterpart()?.to_string(),
                    service_type: fields[0].parse::<ServiceType>()?,
                    description: fields[1].to_string(),
                    address: Address::new(fields[2], fields[3], fields[4]),
                    hours: record.amount,
                })
                .await?;
        }
        OperationKind::Request => {
            let fields = record.detail_fields(4);
            services
                .engine
                .open_request(NewRequest {
                    code: Some(record.engagement()?.to_string()),
                    client: record.actor()?.to_string(),
                    professional: record.counterpart()?.to_string(),
                    description: fields[0].to_string(),
                    address: Address::new(fields[1], fields[2], fields[3]),
                })
                .await?;
        }
        OperationKind::Contact
        | OperationKind::Accept
        | OperationKind::Done
        | OperationKind::Approve
        | OperationKind::Correct
        | OperationKind::Cancel => {
            let event = match record.op {
                OperationKind::Contact => Event::Contact {
                    reply: optional(record.detail()),
                },
                OperationKind::Accept => Event::Accept,
                OperationKind::Done => Event::MarkDone {
                    notes: optional(record.detail()),
                },
                OperationKind::Approve => Event::Approve {
                    charged_amount: record.amount,
                },
                OperationKind::Correct => Event::RequestCorrection {
                    description: record.detail().to_string(),
                },
                _ => Event::Cancel {
                    reason: optional(record.detail()),
                },
            };
            let outcome = services
                .engine
                .apply_transition(record.engagement()?, event, actor(record.actor()?))
                .await?;
            if !outcome.is_applied() {
                debug!(engagement = %outcome.engagement().code, "Row had no effect");
            }
        }
        OperationKind::Message => {
            services
                .responses
                .post_message(record.engagement()?, record.actor()?, record.detail())
                .await?;
        }
        OperationKind::Checkout => {
            let plan: Plan = record.detail().parse()?;
            services
                .reconciler
                .start_checkout(record.actor()?, plan, Some(record.engagement()?.to_string()))
                .await?;
        }
        OperationKind::Webhook => {
            let result = services
                .reconciler
                .reconcile(WebhookPayload::new(
                    record.counterpart()?,
                    record.detail(),
                    record.engagement()?,
                ))
                .await?;
            debug!(reference = %result.reference, outcome = ?result.outcome, "Webhook reconciled");
        }
        OperationKind::Sweep => {
            let promoted = services.engine.sweep_timeouts().await?;
            info!(promoted, "Sweep row processed");
        }
    }
    Ok(())
}
