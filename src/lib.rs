//! Engagement lifecycle and ledger engine for a local-services marketplace.
//!
//! Clients book **reservations** (paid up front) or send **requests**
//! (unpaid, address disclosed progressively) to professionals. The engine
//! moves each engagement through its state machine, debits the professional's
//! token ledger on acceptance, reconciles payment-provider webhooks
//! idempotently and auto-approves work nobody confirmed in time.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
