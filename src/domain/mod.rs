//! Domain types of the engagement lifecycle and the ledgers that gate it.
//!
//! Everything here is synchronous and free of I/O; storage and delivery are
//! reached through the traits in [`ports`].

pub mod disclosure;
pub mod engagement;
pub mod ledger;
pub mod metrics;
pub mod payment;
pub mod ports;
pub mod subscription;
pub mod transition;
