//! Mapping provider payloads to internal user ids.
//!
//! Metadata stamped by our own checkout flow is authoritative. Store lookups
//! by provider reference are only a recovery path for events that arrive
//! without it (renewal invoices, dashboard-initiated changes).

use crate::domain::{metadata_user_id, Invoice, Subscription};
use crate::infrastructure::{BillingRepository, RepositoryError};
use thiserror::Error;
use tracing::debug;

/// A pure extraction step: returns a user id when the payload names one.
pub type Strategy<P> = fn(&P) -> Option<String>;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("No user found for customer {customer_id:?} / subscription {subscription_id:?}")]
    NotFound {
        customer_id: String,
        subscription_id: String,
    },
    #[error("Payload carries no user metadata and no provider references")]
    AmbiguousPayload,
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderRefs {
    pub customer_id: String,
    pub subscription_id: String,
}

impl ProviderRefs {
    pub fn is_empty(&self) -> bool {
        self.customer_id.is_empty() && self.subscription_id.is_empty()
    }
}

/// A payload the resolver can work on.
pub trait IdentitySource: Sized + 'static {
    /// Metadata strategies, most trusted first.
    fn strategies() -> &'static [(&'static str, Strategy<Self>)];

    fn provider_refs(&self) -> ProviderRefs;
}

fn invoice_metadata(invoice: &Invoice) -> Option<String> {
    metadata_user_id(&invoice.metadata)
}

fn invoice_subscription_details_metadata(invoice: &Invoice) -> Option<String> {
    invoice
        .subscription_details()
        .and_then(|details| metadata_user_id(&details.metadata))
}

fn invoice_line_item_metadata(invoice: &Invoice) -> Option<String> {
    invoice
        .line_items()
        .iter()
        .find_map(|line| metadata_user_id(&line.metadata))
}

const INVOICE_STRATEGIES: &[(&str, Strategy<Invoice>)] = &[
    ("invoice_metadata", invoice_metadata),
    (
        "subscription_details_metadata",
        invoice_subscription_details_metadata,
    ),
    ("line_item_metadata", invoice_line_item_metadata),
];

impl IdentitySource for Invoice {
    fn strategies() -> &'static [(&'static str, Strategy<Self>)] {
        INVOICE_STRATEGIES
    }

    fn provider_refs(&self) -> ProviderRefs {
        ProviderRefs {
            customer_id: self.customer_id(),
            subscription_id: self.subscription_id(),
        }
    }
}

fn subscription_metadata(subscription: &Subscription) -> Option<String> {
    metadata_user_id(&subscription.metadata)
}

fn subscription_item_metadata(subscription: &Subscription) -> Option<String> {
    subscription
        .items()
        .iter()
        .find_map(|item| metadata_user_id(&item.metadata))
}

const SUBSCRIPTION_STRATEGIES: &[(&str, Strategy<Subscription>)] = &[
    ("subscription_metadata", subscription_metadata),
    ("subscription_item_metadata", subscription_item_metadata),
];

impl IdentitySource for Subscription {
    fn strategies() -> &'static [(&'static str, Strategy<Self>)] {
        SUBSCRIPTION_STRATEGIES
    }

    fn provider_refs(&self) -> ProviderRefs {
        ProviderRefs {
            customer_id: self.customer_id(),
            subscription_id: self.subscription_id(),
        }
    }
}

/// Runs the metadata strategies in order without touching the store.
pub fn resolve_from_metadata<P: IdentitySource>(payload: &P) -> Option<String> {
    P::strategies().iter().find_map(|(name, strategy)| {
        let user_id = strategy(payload)?;
        debug!(strategy = *name, user_id = %user_id, "Resolved user from metadata");
        Some(user_id)
    })
}

/// Subscription reference first, customer reference only when that misses.
pub async fn lookup_user_by_refs<R>(
    repo: &R,
    refs: &ProviderRefs,
) -> Result<Option<String>, RepositoryError>
where
    R: BillingRepository + ?Sized,
{
    if !refs.subscription_id.is_empty() {
        if let Some(user_id) = repo.find_user_by_subscription(&refs.subscription_id).await? {
            return Ok(Some(user_id));
        }
    }

    if !refs.customer_id.is_empty() {
        if let Some(user_id) = repo.find_user_by_customer(&refs.customer_id).await? {
            return Ok(Some(user_id));
        }
    }

    Ok(None)
}

pub async fn resolve_user_id<P, R>(repo: &R, payload: &P) -> Result<String, IdentityError>
where
    P: IdentitySource,
    R: BillingRepository + ?Sized,
{
    if let Some(user_id) = resolve_from_metadata(payload) {
        return Ok(user_id);
    }

    let refs = payload.provider_refs();
    if refs.is_empty() {
        return Err(IdentityError::AmbiguousPayload);
    }

    match lookup_user_by_refs(repo, &refs).await? {
        Some(user_id) => {
            debug!(
                user_id = %user_id,
                customer_id = %refs.customer_id,
                subscription_id = %refs.subscription_id,
                "Resolved user from stored billing record"
            );
            Ok(user_id)
        }
        None => Err(IdentityError::NotFound {
            customer_id: refs.customer_id,
            subscription_id: refs.subscription_id,
        }),
    }
}
