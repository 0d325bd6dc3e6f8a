//! Filestore Billing
//!
//! Reconciles payment-provider webhook events into the per-user plan, API
//! quota and billing record of the file-storage service.
//!
//! ## Standalone
//!
//! Replay stored webhook payloads against the database:
//! ```bash
//! filestore-billing replay events/evt_1.json events/evt_2.json
//! ```
//!
//! ## Embedded
//!
//! The webhook layer of a host service hands verified event bodies to the
//! reconciliation service:
//! ```rust,ignore
//! use filestore_billing::{AppConfig, PostgresBillingRepository, ReconciliationService, StripeEvent};
//! use std::sync::Arc;
//!
//! let cfg = AppConfig::from_env()?;
//! let pool = sqlx::PgPool::connect(&cfg.database_url).await?;
//! let service = ReconciliationService::new(
//!     Arc::new(PostgresBillingRepository::new(pool)),
//!     cfg.reconciliation(),
//! );
//! let outcome = service.dispatch(&StripeEvent::from_json(&body)?).await?;
//! ```

pub mod application;
pub mod domain;
pub mod infrastructure;

// Operator binary support. Enabled behind the `cli` feature so the core
// library can be embedded without clap or a global subscriber.
#[cfg(feature = "cli")]
pub mod cli;

pub use application::*;
pub use domain::*;
pub use infrastructure::*;
