use crate::application::identity::{resolve_user_id, IdentityError};
use crate::domain::{
    metadata_user_id, BillingRecord, BillingUpsert, CheckoutSession, EventError, InboundEvent,
    Invoice, PlanTier, StripeEvent, Subscription, SubscriptionLifecycle, SubscriptionStatusUpdate,
    STATUS_ACTIVE,
};
use crate::infrastructure::{BillingRepository, BillingTransaction, RepositoryError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const INVOICE_PAID: &str = "invoice.paid";
const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// Used when an event carries no price reference of its own.
    pub fallback_price_id: String,
}

#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("Could not resolve user for {event}: {source}")]
    Identity {
        event: &'static str,
        #[source]
        source: IdentityError,
    },
    #[error("{0} has no userID in its metadata")]
    MissingUserId(&'static str),
    #[error("{0} carries neither a customer nor a subscription reference")]
    MissingReferences(&'static str),
    #[error("{operation}: no matching row ({detail})")]
    NoMatchingRow {
        operation: &'static str,
        detail: String,
    },
    #[error("{operation} failed: {source}")]
    Persistence {
        operation: &'static str,
        #[source]
        source: RepositoryError,
    },
}

impl ReconciliationError {
    /// Whether redelivering the same event could succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconciliationError::Persistence { .. }
                | ReconciliationError::Identity {
                    source: IdentityError::Repository(_),
                    ..
                }
        )
    }
}

fn persistence(operation: &'static str) -> impl FnOnce(RepositoryError) -> ReconciliationError {
    move |err| match err {
        RepositoryError::NotFound(detail) => ReconciliationError::NoMatchingRow { operation, detail },
        source => ReconciliationError::Persistence { operation, source },
    }
}

fn identity(event: &'static str) -> impl FnOnce(IdentityError) -> ReconciliationError {
    move |source| ReconciliationError::Identity { event, source }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The event changed persisted state. `user_id` is `None` when the
    /// handler matched by provider reference without resolving a user.
    Applied { user_id: Option<String> },
    Ignored,
}

pub struct ReconciliationService<R>
where
    R: BillingRepository,
{
    repo: Arc<R>,
    config: ReconciliationConfig,
}

impl<R> ReconciliationService<R>
where
    R: BillingRepository,
{
    pub fn new(repo: Arc<R>, config: ReconciliationConfig) -> Self {
        Self { repo, config }
    }

    pub async fn dispatch(&self, event: &StripeEvent) -> Result<Outcome, ReconciliationError> {
        let Some(inbound) = InboundEvent::from_envelope(event)? else {
            debug!(event_id = %event.id, event_type = %event.event_type, "Ignoring event");
            return Ok(Outcome::Ignored);
        };

        let user_id = self.handle(&inbound).await?;
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            user_id = user_id.as_deref().unwrap_or("-"),
            "Event reconciled"
        );

        Ok(Outcome::Applied { user_id })
    }

    pub async fn handle(&self, event: &InboundEvent) -> Result<Option<String>, ReconciliationError> {
        match event {
            InboundEvent::InvoicePaid(invoice) => self.handle_invoice_paid(invoice).await.map(Some),
            InboundEvent::CheckoutSessionCompleted(session) => {
                self.handle_checkout_session_completed(session).await.map(Some)
            }
            InboundEvent::SubscriptionUpdated(subscription) => {
                self.handle_subscription_updated(subscription).await.map(|_| None)
            }
            InboundEvent::SubscriptionDeleted(subscription) => {
                self.handle_subscription_deleted(subscription).await.map(Some)
            }
        }
    }

    /// Upgrade to pro and mark the billing record active for the paid window.
    /// Replaying the same invoice leaves the same state behind.
    pub async fn handle_invoice_paid(&self, invoice: &Invoice) -> Result<String, ReconciliationError> {
        let user_id = resolve_user_id(&*self.repo, invoice)
            .await
            .map_err(identity(INVOICE_PAID))?;

        let (current_period_start, current_period_end) = invoice.period_window();
        let price_id = invoice
            .price_id()
            .unwrap_or_else(|| self.config.fallback_price_id.clone());

        self.repo
            .apply_plan(&user_id, PlanTier::Pro)
            .await
            .map_err(persistence("upgrade plan to pro"))?;

        self.repo
            .upsert_billing_record(&BillingUpsert {
                user_id: user_id.clone(),
                stripe_customer_id: invoice.customer_id(),
                stripe_subscription_id: invoice.subscription_id(),
                price_id,
                lifecycle: Some(SubscriptionLifecycle {
                    status: STATUS_ACTIVE.to_string(),
                    current_period_start,
                    current_period_end,
                    cancel_at_period_end: false,
                }),
            })
            .await
            .map_err(persistence("upsert billing record"))?;

        info!(user_id = %user_id, invoice_id = %invoice.id, "Invoice paid handled");
        Ok(user_id)
    }

    /// Record provider references for a finished checkout. The billing row may
    /// not exist yet, so only session metadata can identify the user.
    pub async fn handle_checkout_session_completed(
        &self,
        session: &CheckoutSession,
    ) -> Result<String, ReconciliationError> {
        let user_id = metadata_user_id(&session.metadata)
            .ok_or(ReconciliationError::MissingUserId(CHECKOUT_COMPLETED))?;

        self.repo
            .upsert_billing_record(&BillingUpsert {
                user_id: user_id.clone(),
                stripe_customer_id: session.customer_id(),
                stripe_subscription_id: session.subscription_id(),
                price_id: self.config.fallback_price_id.clone(),
                lifecycle: None,
            })
            .await
            .map_err(persistence("record checkout references"))?;

        info!(user_id = %user_id, session_id = %session.id, "Checkout session recorded");
        Ok(user_id)
    }

    // Matches by provider reference only. A subscription whose checkout event
    // was never recorded has no row to match and fails with NoMatchingRow.
    pub async fn handle_subscription_updated(
        &self,
        subscription: &Subscription,
    ) -> Result<(), ReconciliationError> {
        let update = SubscriptionStatusUpdate {
            stripe_customer_id: subscription.customer_id(),
            stripe_subscription_id: subscription.subscription_id(),
            status: subscription.status.clone(),
            cancel_at_period_end: subscription.cancel_at_period_end,
        };

        if update.stripe_customer_id.is_empty() && update.stripe_subscription_id.is_empty() {
            return Err(ReconciliationError::MissingReferences(SUBSCRIPTION_UPDATED));
        }

        self.repo
            .update_subscription_status(&update)
            .await
            .map_err(persistence("update subscription status"))?;

        info!(
            subscription_id = %update.stripe_subscription_id,
            status = %update.status,
            cancel_at_period_end = update.cancel_at_period_end,
            "Subscription status updated"
        );
        Ok(())
    }

    /// Cancel the billing record and downgrade to basic in one transaction.
    pub async fn handle_subscription_deleted(
        &self,
        subscription: &Subscription,
    ) -> Result<String, ReconciliationError> {
        let user_id = resolve_user_id(&*self.repo, subscription)
            .await
            .map_err(identity(SUBSCRIPTION_DELETED))?;

        let mut tx = self
            .repo
            .begin()
            .await
            .map_err(persistence("begin cancellation"))?;

        if let Err(err) = cancel_and_downgrade(tx.as_mut(), &user_id).await {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(user_id = %user_id, "Rollback after failed cancellation errored: {}", rollback_err);
            }
            return Err(err);
        }

        tx.commit()
            .await
            .map_err(persistence("commit cancellation"))?;

        info!(user_id = %user_id, "Subscription deleted, user downgraded to basic");
        Ok(user_id)
    }

    /// Current billing record for a user, `None` if no event has created one.
    pub async fn billing_record(
        &self,
        user_id: &str,
    ) -> Result<Option<BillingRecord>, ReconciliationError> {
        match self.repo.get_billing_record(user_id).await {
            Ok(record) => Ok(Some(record)),
            Err(RepositoryError::NotFound(_)) => Ok(None),
            Err(source) => Err(ReconciliationError::Persistence {
                operation: "read billing record",
                source,
            }),
        }
    }
}

async fn cancel_and_downgrade(
    tx: &mut dyn BillingTransaction,
    user_id: &str,
) -> Result<(), ReconciliationError> {
    let touched = tx
        .mark_canceled(user_id)
        .await
        .map_err(persistence("mark subscription canceled"))?;
    if touched == 0 {
        warn!(user_id = %user_id, "No billing record to cancel, downgrading plan anyway");
    }

    tx.apply_plan(user_id, PlanTier::Basic)
        .await
        .map_err(persistence("downgrade plan to basic"))?;

    Ok(())
}
