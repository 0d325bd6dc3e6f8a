//! Provider webhook payloads.
//!
//! Every field is optional on the wire: renewal invoices routinely omit
//! metadata, and references may arrive either as a bare id or as an expanded
//! object. Nothing here talks to the database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use thiserror::Error;

/// Metadata key our checkout flow stamps onto provider objects.
pub const USER_ID_METADATA_KEY: &str = "userID";

pub type Metadata = HashMap<String, String>;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Malformed event envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("Malformed {event_type} payload: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Trimmed `userID` tag, or `None` when missing or blank.
pub fn metadata_user_id(metadata: &Metadata) -> Option<String> {
    metadata
        .get(USER_ID_METADATA_KEY)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn unix_to_datetime(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

/// A provider reference that is either a bare id or an expanded object.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ExpandableRef {
    Id(String),
    Object { id: String },
}

impl ExpandableRef {
    pub fn id(&self) -> &str {
        match self {
            ExpandableRef::Id(id) => id.trim(),
            ExpandableRef::Object { id } => id.trim(),
        }
    }
}

fn ref_id(reference: &Option<ExpandableRef>) -> String {
    reference
        .as_ref()
        .map(|r| r.id().to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Period {
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Invoice {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub customer: Option<ExpandableRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default)]
    pub lines: Option<InvoiceLineList>,
    #[serde(default)]
    pub period_start: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
    #[serde(default)]
    pub subscription: Option<ExpandableRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLineList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: Vec<InvoiceLineItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLineItem {
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
    #[serde(default)]
    pub period: Option<Period>,
    #[serde(default)]
    pub subscription: Option<ExpandableRef>,
    #[serde(default)]
    pub parent: Option<LineItemParent>,
    #[serde(default)]
    pub pricing: Option<LineItemPricing>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LineItemParent {
    #[serde(default)]
    pub subscription_item_details: Option<SubscriptionItemDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItemDetails {
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LineItemPricing {
    #[serde(default)]
    pub price_details: Option<PriceDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriceDetails {
    #[serde(default)]
    pub price: Option<String>,
}

impl InvoiceLineItem {
    fn subscription_id(&self) -> Option<String> {
        let direct = ref_id(&self.subscription);
        if !direct.is_empty() {
            return Some(direct);
        }

        self.parent
            .as_ref()
            .and_then(|p| p.subscription_item_details.as_ref())
            .and_then(|d| d.subscription.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn price_id(&self) -> Option<String> {
        self.pricing
            .as_ref()
            .and_then(|p| p.price_details.as_ref())
            .and_then(|d| d.price.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

impl Invoice {
    pub fn line_items(&self) -> &[InvoiceLineItem] {
        self.lines.as_ref().map(|l| l.data.as_slice()).unwrap_or(&[])
    }

    pub fn subscription_details(&self) -> Option<&SubscriptionDetails> {
        self.parent
            .as_ref()
            .and_then(|p| p.subscription_details.as_ref())
    }

    pub fn customer_id(&self) -> String {
        ref_id(&self.customer)
    }

    /// Subscription reference from the parent details, else the first line
    /// item that names one. Empty when the invoice carries none.
    pub fn subscription_id(&self) -> String {
        let from_parent = self
            .subscription_details()
            .map(|d| ref_id(&d.subscription))
            .unwrap_or_default();
        if !from_parent.is_empty() {
            return from_parent;
        }

        self.line_items()
            .iter()
            .find_map(InvoiceLineItem::subscription_id)
            .unwrap_or_default()
    }

    pub fn price_id(&self) -> Option<String> {
        self.line_items().iter().find_map(InvoiceLineItem::price_id)
    }

    /// Billing window: the first line item's period when it has one,
    /// otherwise the invoice's own period.
    pub fn period_window(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        if let Some(period) = self.line_items().first().and_then(|l| l.period.as_ref()) {
            return (unix_to_datetime(period.start), unix_to_datetime(period.end));
        }

        (
            unix_to_datetime(self.period_start),
            unix_to_datetime(self.period_end),
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub customer: Option<ExpandableRef>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
    #[serde(default)]
    pub items: Option<SubscriptionItemList>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItemList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

impl Subscription {
    pub fn subscription_id(&self) -> String {
        self.id.trim().to_string()
    }

    pub fn customer_id(&self) -> String {
        ref_id(&self.customer)
    }

    pub fn items(&self) -> &[SubscriptionItem] {
        self.items.as_ref().map(|i| i.data.as_slice()).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutSession {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub customer: Option<ExpandableRef>,
    #[serde(default)]
    pub subscription: Option<ExpandableRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

impl CheckoutSession {
    pub fn customer_id(&self) -> String {
        ref_id(&self.customer)
    }

    pub fn subscription_id(&self) -> String {
        ref_id(&self.subscription)
    }
}

/// Raw webhook envelope as delivered by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

impl StripeEvent {
    pub fn from_json(raw: &str) -> Result<Self, EventError> {
        serde_json::from_str(raw).map_err(EventError::Envelope)
    }
}

#[derive(Debug, Clone)]
pub enum InboundEvent {
    InvoicePaid(Invoice),
    CheckoutSessionCompleted(CheckoutSession),
    SubscriptionUpdated(Subscription),
    SubscriptionDeleted(Subscription),
}

impl InboundEvent {
    /// Classify an envelope. Event types this service does not reconcile
    /// yield `Ok(None)`.
    pub fn from_envelope(event: &StripeEvent) -> Result<Option<Self>, EventError> {
        let parsed = match event.event_type.as_str() {
            "invoice.paid" | "invoice.payment_succeeded" => {
                Self::InvoicePaid(parse_object(event)?)
            }
            "checkout.session.completed" => Self::CheckoutSessionCompleted(parse_object(event)?),
            "customer.subscription.updated" => Self::SubscriptionUpdated(parse_object(event)?),
            "customer.subscription.deleted" => Self::SubscriptionDeleted(parse_object(event)?),
            _ => return Ok(None),
        };

        Ok(Some(parsed))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::InvoicePaid(_) => "invoice.paid",
            InboundEvent::CheckoutSessionCompleted(_) => "checkout.session.completed",
            InboundEvent::SubscriptionUpdated(_) => "customer.subscription.updated",
            InboundEvent::SubscriptionDeleted(_) => "customer.subscription.deleted",
        }
    }
}

fn parse_object<'a, T>(event: &'a StripeEvent) -> Result<T, EventError>
where
    T: Deserialize<'a>,
{
    T::deserialize(&event.data.object).map_err(|source| EventError::Payload {
        event_type: event.event_type.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_type: &str, object: serde_json::Value) -> StripeEvent {
        StripeEvent {
            id: "evt_1".to_string(),
            event_type: event_type.to_string(),
            created: 1_700_000_000,
            data: StripeEventData { object },
        }
    }

    #[test]
    fn expandable_refs_accept_id_or_object() {
        let invoice: Invoice = serde_json::from_value(json!({
            "customer": { "id": " cus_obj ", "email": "a@b.c" },
        }))
        .unwrap();
        assert_eq!(invoice.customer_id(), "cus_obj");

        let invoice: Invoice = serde_json::from_value(json!({ "customer": "cus_str" })).unwrap();
        assert_eq!(invoice.customer_id(), "cus_str");

        let invoice: Invoice = serde_json::from_value(json!({ "customer": null })).unwrap();
        assert_eq!(invoice.customer_id(), "");
    }

    #[test]
    fn null_collections_parse_as_empty() {
        let invoice: Invoice = serde_json::from_value(json!({
            "metadata": null,
            "lines": { "data": null },
        }))
        .unwrap();
        assert!(invoice.metadata.is_empty());
        assert!(invoice.line_items().is_empty());
    }

    #[test]
    fn blank_user_id_tag_is_absent() {
        let mut metadata = Metadata::new();
        metadata.insert(USER_ID_METADATA_KEY.to_string(), "   ".to_string());
        assert_eq!(metadata_user_id(&metadata), None);

        metadata.insert(USER_ID_METADATA_KEY.to_string(), " u1 ".to_string());
        assert_eq!(metadata_user_id(&metadata).as_deref(), Some("u1"));
    }

    #[test]
    fn invoice_subscription_prefers_parent_details() {
        let invoice: Invoice = serde_json::from_value(json!({
            "parent": { "subscription_details": { "subscription": "sub_parent" } },
            "lines": { "data": [ { "subscription": "sub_line" } ] },
        }))
        .unwrap();
        assert_eq!(invoice.subscription_id(), "sub_parent");
    }

    #[test]
    fn invoice_subscription_falls_back_to_line_item_details() {
        let invoice: Invoice = serde_json::from_value(json!({
            "lines": { "data": [
                { "metadata": {} },
                { "parent": { "subscription_item_details": { "subscription": "sub_item" } } },
            ] },
        }))
        .unwrap();
        assert_eq!(invoice.subscription_id(), "sub_item");

        let empty: Invoice = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.subscription_id(), "");
    }

    #[test]
    fn invoice_price_takes_first_line_with_price() {
        let invoice: Invoice = serde_json::from_value(json!({
            "lines": { "data": [
                { "pricing": null },
                { "pricing": { "price_details": { "price": "price_pro" } } },
            ] },
        }))
        .unwrap();
        assert_eq!(invoice.price_id().as_deref(), Some("price_pro"));
    }

    #[test]
    fn period_window_prefers_first_line_item() {
        let invoice: Invoice = serde_json::from_value(json!({
            "period_start": 1_690_000_000,
            "period_end": 1_690_100_000,
            "lines": { "data": [
                { "period": { "start": 1_700_000_000, "end": 1_702_592_000 } },
            ] },
        }))
        .unwrap();
        let (start, end) = invoice.period_window();
        assert_eq!(start.map(|t| t.timestamp()), Some(1_700_000_000));
        assert_eq!(end.map(|t| t.timestamp()), Some(1_702_592_000));

        let invoice: Invoice = serde_json::from_value(json!({
            "period_start": 1_690_000_000,
            "period_end": 1_690_100_000,
            "lines": { "data": [ { "metadata": {} } ] },
        }))
        .unwrap();
        let (start, end) = invoice.period_window();
        assert_eq!(start.map(|t| t.timestamp()), Some(1_690_000_000));
        assert_eq!(end.map(|t| t.timestamp()), Some(1_690_100_000));
    }

    #[test]
    fn envelope_classification() {
        let paid = envelope("invoice.payment_succeeded", json!({ "id": "in_1" }));
        assert!(matches!(
            InboundEvent::from_envelope(&paid),
            Ok(Some(InboundEvent::InvoicePaid(_)))
        ));

        let deleted = envelope("customer.subscription.deleted", json!({ "id": "sub_1" }));
        let parsed = InboundEvent::from_envelope(&deleted).unwrap().unwrap();
        assert_eq!(parsed.kind(), "customer.subscription.deleted");

        let other = envelope("charge.refunded", json!({}));
        assert!(InboundEvent::from_envelope(&other).unwrap().is_none());
    }

    #[test]
    fn malformed_payload_names_event_type() {
        let bad = envelope(
            "customer.subscription.updated",
            json!({ "cancel_at_period_end": "yes" }),
        );
        let err = InboundEvent::from_envelope(&bad).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Malformed customer.subscription.updated payload"));
    }

    #[test]
    fn envelope_from_json() {
        let raw = r#"{"id":"evt_9","type":"invoice.paid","created":1,"data":{"object":{}}}"#;
        let event = StripeEvent::from_json(raw).unwrap();
        assert_eq!(event.event_type, "invoice.paid");

        assert!(matches!(
            StripeEvent::from_json("{not json"),
            Err(EventError::Envelope(_))
        ));
    }
}
