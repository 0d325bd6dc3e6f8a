use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_CANCELED: &str = "canceled";
const STATUS_TRIALING: &str = "trialing";

/// One row of the `stripe` table. `subscription_status` mirrors the provider
/// vocabulary verbatim and is never parsed into a closed set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BillingRecord {
    pub user_id: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub price_id: Option<String>,
    pub subscription_status: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Active,
    CancelScheduled,
    Canceled,
    Inactive,
}

impl BillingRecord {
    pub fn state(&self) -> SubscriptionState {
        match self.subscription_status.as_deref() {
            Some(STATUS_CANCELED) => SubscriptionState::Canceled,
            Some(_) if self.cancel_at_period_end => SubscriptionState::CancelScheduled,
            Some(STATUS_ACTIVE) | Some(STATUS_TRIALING) => SubscriptionState::Active,
            _ => SubscriptionState::Inactive,
        }
    }
}

/// Status, period window and cancellation flag reported by a paid invoice.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionLifecycle {
    pub status: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

/// Input for the create-or-merge write on the `stripe` table.
///
/// Empty provider identifiers never overwrite stored ones. When `lifecycle`
/// is `None` the status columns are left as they are.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingUpsert {
    pub user_id: String,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub price_id: String,
    pub lifecycle: Option<SubscriptionLifecycle>,
}

/// Direct status write matched by provider reference instead of user id.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionStatusUpdate {
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub status: String,
    pub cancel_at_period_end: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: Option<&str>, cancel_at_period_end: bool) -> BillingRecord {
        BillingRecord {
            user_id: "u1".to_string(),
            stripe_customer_id: Some("cus_1".to_string()),
            stripe_subscription_id: Some("sub_1".to_string()),
            price_id: Some("price_1".to_string()),
            subscription_status: status.map(str::to_string),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end,
            canceled_at: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn classifies_subscription_state() {
        assert_eq!(record(Some("active"), false).state(), SubscriptionState::Active);
        assert_eq!(record(Some("trialing"), false).state(), SubscriptionState::Active);
        assert_eq!(
            record(Some("active"), true).state(),
            SubscriptionState::CancelScheduled
        );
        assert_eq!(record(Some("canceled"), false).state(), SubscriptionState::Canceled);
        assert_eq!(record(Some("canceled"), true).state(), SubscriptionState::Canceled);
        assert_eq!(record(Some("past_due"), false).state(), SubscriptionState::Inactive);
        assert_eq!(record(None, false).state(), SubscriptionState::Inactive);
    }
}
