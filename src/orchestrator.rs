// src/orchestrator.rs

//! Entry point for commerce webhooks.
//!
//! Every delivery goes through the same steps: signature check, topic
//! routing, payload validation, deduplication, and then one independent unit
//! of work per product in the event. A unit that keeps failing with transient
//! errors is retried with exponential backoff and finally dead-lettered; its
//! siblings are unaffected. Notifications go out only after the graph write
//! committed and are never retried.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

use crate::config::RetrySettings;
use crate::dead_letter::{DeadLetterSink, NewDeadLetter};
use crate::error::{bounded, StoreError};
use crate::graph::{
    CancelPurchase, CompletePurchase, GrantWrite, ProductNode, PurchaseRecord, PurchaseStatus,
    PurchaseWrite, RevokeOutcome, Transition, UserNode,
};
use crate::idempotency::IdempotencyGuard;
use crate::models::{
    parse_order, parse_refund, OrderLine, PayloadError, ValidatedOrder, ValidatedRefund,
    DEFAULT_CURRENCY,
};
use crate::notify::{GrantNotice, NotificationDispatcher, NotificationReceipt, RevokeNotice};
use crate::signature::SignatureVerifier;
use crate::sync::SyncService;
use crate::tokens::AccessTokenService;

pub const REASON_ORDER_CANCELLED: &str = "order_cancelled";
pub const REASON_REFUND_CREATED: &str = "refund_created";

/// Item key used when a failure concerns the whole event.
const WHOLE_EVENT: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    OrderPaid,
    OrderCancelled,
    RefundCreated,
}

impl Topic {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "orders/paid" => Some(Topic::OrderPaid),
            "orders/cancelled" => Some(Topic::OrderCancelled),
            "refunds/create" => Some(Topic::RefundCreated),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::OrderPaid => "orders/paid",
            Topic::OrderCancelled => "orders/cancelled",
            Topic::RefundCreated => "refunds/create",
        }
    }
}

/// One inbound webhook as received over HTTP.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub topic: String,
    pub event_id: Option<String>,
    pub shop_domain: Option<String>,
    pub signature: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Purchase recorded and access granted.
    Granted,
    /// Purchase recorded; the product grants no access.
    Recorded,
    Revoked,
    NotActive,
    /// A grant from a different or newer order is in place and was kept.
    Superseded,
    /// A newer event already changed this record; nothing was written.
    Stale,
    DeadLettered,
    /// Could not be processed and could not be dead-lettered either.
    Failed,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ItemReport {
    pub product_id: String,
    pub order_id: String,
    pub status: ItemStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationReceipt>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed {
        event_id: String,
        topic: String,
        items: Vec<ItemReport>,
    },
    Duplicate {
        event_id: String,
    },
    Ignored {
        topic: String,
    },
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error("idempotency store error: {0}")]
    Idempotency(#[from] StoreError),
}

impl From<PayloadError> for WebhookError {
    fn from(value: PayloadError) -> Self {
        WebhookError::Validation(value.to_string())
    }
}

/// Which products carry access. `None` means every product does.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    product_ids: Option<HashSet<String>>,
}

impl AccessPolicy {
    pub fn new(product_ids: Option<HashSet<String>>) -> Self {
        Self { product_ids }
    }

    pub fn grants_access(&self, product_id: &str) -> bool {
        self.product_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(product_id))
    }
}

/// Delay before retry number `retry` (1-based): `base × 2^(retry-1)`.
pub(crate) fn backoff_delay(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
}

struct EventContext {
    event_id: String,
    topic: Topic,
    shop_domain: Option<String>,
}

struct Failure {
    reason: String,
    attempts: u32,
}

/// A refunded product resolved to its purchaser.
#[derive(Debug, Clone, Serialize)]
struct RefundTarget {
    email: String,
    product_id: String,
    title: Option<String>,
    amount: Decimal,
    currency: String,
    quantity: i32,
}

#[derive(Clone)]
pub struct WebhookOrchestrator {
    verifier: SignatureVerifier,
    guard: IdempotencyGuard,
    tokens: AccessTokenService,
    sync: SyncService,
    notifier: NotificationDispatcher,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry: RetrySettings,
    policy: AccessPolicy,
    call_timeout: Duration,
}

impl WebhookOrchestrator {
    pub fn new(
        verifier: SignatureVerifier,
        guard: IdempotencyGuard,
        tokens: AccessTokenService,
        sync: SyncService,
        notifier: NotificationDispatcher,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            verifier,
            guard,
            tokens,
            sync,
            notifier,
            dead_letters,
            retry: RetrySettings::default(),
            policy: AccessPolicy::default(),
            call_timeout: Duration::from_secs(5),
        }
    }

    /// Upper bound on the dead-letter write made after retries run out.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_access_policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub async fn handle(&self, delivery: WebhookDelivery) -> Result<WebhookOutcome, WebhookError> {
        let received_at = Utc::now();
        let event_id = delivery
            .event_id
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let shop = delivery.shop_domain.as_deref().unwrap_or("-");

        let signature = delivery.signature.as_deref().unwrap_or_default();
        if signature.is_empty() || !self.verifier.verify(&delivery.body, signature) {
            log::warn!(
                target: "security",
                "webhook signature rejected topic={} event_id={} shop={}",
                delivery.topic,
                event_id,
                shop
            );
            return Err(WebhookError::Unauthorized("invalid webhook signature"));
        }

        let Some(topic) = Topic::parse(&delivery.topic) else {
            log::warn!(
                "ignoring unknown webhook topic={} event_id={} shop={}",
                delivery.topic,
                event_id,
                shop
            );
            return Ok(WebhookOutcome::Ignored {
                topic: delivery.topic,
            });
        };

        if event_id.is_empty() {
            return Err(WebhookError::Validation("missing webhook event id".into()));
        }

        // validation happens before the idempotency claim so that a corrected
        // redelivery with the same event id is not swallowed as a duplicate
        let event = match topic {
            Topic::OrderPaid | Topic::OrderCancelled => {
                ParsedEvent::Order(parse_order(&delivery.body, received_at)?)
            }
            Topic::RefundCreated => ParsedEvent::Refund(parse_refund(&delivery.body, received_at)?),
        };

        if !self.guard.accepted(&event_id, topic.as_str()).await? {
            log::info!(
                "duplicate webhook topic={} event_id={} shop={}",
                topic.as_str(),
                event_id,
                shop
            );
            return Ok(WebhookOutcome::Duplicate { event_id });
        }

        let ctx = EventContext {
            event_id: event_id.clone(),
            topic,
            shop_domain: delivery.shop_domain.clone(),
        };

        let items = match (&event, topic) {
            (ParsedEvent::Order(order), Topic::OrderPaid) => {
                join_all(order.lines.iter().map(|line| self.fulfil_line(&ctx, order, line))).await
            }
            (ParsedEvent::Order(order), _) => {
                join_all(order.lines.iter().map(|line| self.cancel_line(&ctx, order, line))).await
            }
            (ParsedEvent::Refund(refund), _) => self.refund(&ctx, refund).await,
        };

        log::info!(
            "webhook processed topic={} event_id={} shop={} items={} failed={}",
            topic.as_str(),
            event_id,
            shop,
            items.len(),
            items
                .iter()
                .filter(|i| matches!(i.status, ItemStatus::DeadLettered | ItemStatus::Failed))
                .count()
        );

        Ok(WebhookOutcome::Processed {
            event_id,
            topic: topic.as_str().to_string(),
            items,
        })
    }

    async fn retrying<T, F, Fut>(&self, ctx: &EventContext, item_key: &str, op: F) -> Result<(T, u32), Failure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = backoff_delay(self.retry.base_delay, attempt);
                    log::warn!(
                        "transient failure event_id={} item={} attempt={}/{} retry_in={:?} error={e}",
                        ctx.event_id,
                        item_key,
                        attempt,
                        max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(Failure {
                        reason: e.to_string(),
                        attempts: attempt,
                    })
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        ctx: &EventContext,
        item_key: &str,
        order_id: &str,
        payload: serde_json::Value,
        failure: Failure,
    ) -> ItemReport {
        let entry = NewDeadLetter {
            event_id: ctx.event_id.clone(),
            topic: ctx.topic.as_str().to_string(),
            shop_domain: ctx.shop_domain.clone(),
            item_key: item_key.to_string(),
            payload,
            failure_reason: failure.reason.clone(),
            attempt_count: i32::try_from(failure.attempts).unwrap_or(i32::MAX),
        };

        let pushed = bounded(
            "dead_letter_push",
            self.call_timeout,
            self.dead_letters.push(entry),
        )
        .await;
        let status = match pushed {
            Ok(stored) => {
                log::error!(
                    "dead-lettered event_id={} topic={} item={} dead_letter_id={} attempts={} reason={}",
                    ctx.event_id,
                    ctx.topic.as_str(),
                    item_key,
                    stored.id,
                    failure.attempts,
                    failure.reason
                );
                ItemStatus::DeadLettered
            }
            Err(e) => {
                log::error!(
                    "dead letter write failed event_id={} topic={} item={} reason={} error={e}",
                    ctx.event_id,
                    ctx.topic.as_str(),
                    item_key,
                    failure.reason
                );
                ItemStatus::Failed
            }
        };

        ItemReport {
            product_id: item_key.to_string(),
            order_id: order_id.to_string(),
            status,
            attempts: failure.attempts,
            detail: Some(failure.reason),
            notification: None,
        }
    }

    fn user_node(order: &ValidatedOrder) -> UserNode {
        UserNode {
            email: order.email.clone(),
            display_name: order.display_name.clone(),
            external_customer_id: order.customer_id.clone(),
        }
    }

    fn product_node(&self, line: &OrderLine, currency: &str) -> ProductNode {
        ProductNode {
            product_id: line.product_id.clone(),
            title: line.title.clone(),
            unit_price: Some(line.unit_price),
            currency: Some(currency.to_string()),
            grants_access: self.policy.grants_access(&line.product_id),
        }
    }

    fn purchase_write(order: &ValidatedOrder, line: &OrderLine, status: PurchaseStatus) -> PurchaseWrite {
        PurchaseWrite {
            email: order.email.clone(),
            product_id: line.product_id.clone(),
            order_id: order.order_id.clone(),
            amount: line.amount,
            currency: order.currency.clone(),
            quantity: line.quantity,
            status,
            event_at: order.event_at,
        }
    }

    async fn fulfil_line(&self, ctx: &EventContext, order: &ValidatedOrder, line: &OrderLine) -> ItemReport {
        let user = Self::user_node(order);
        let product = self.product_node(line, &order.currency);

        // issued once so every retry writes the same token id
        let issued = if product.grants_access {
            match self.tokens.generate(
                user.id(),
                &order.email,
                &line.product_id,
                &order.order_id,
                line.title.as_deref(),
            ) {
                Ok(issued) => Some(issued),
                Err(e) => {
                    let failure = Failure {
                        reason: e.to_string(),
                        attempts: 1,
                    };
                    return self
                        .dead_letter(ctx, &line.product_id, &order.order_id, json!({"order": order, "line": line}), failure)
                        .await;
                }
            }
        } else {
            None
        };

        let cmd = CompletePurchase {
            user,
            product,
            purchase: Self::purchase_write(order, line, PurchaseStatus::Paid),
            grant: issued.as_ref().map(|t| GrantWrite {
                email: order.email.clone(),
                product_id: line.product_id.clone(),
                order_id: order.order_id.clone(),
                token_id: t.token_id,
                granted_at: t.issued_at,
                expires_at: t.expires_at,
                event_at: order.event_at,
            }),
        };

        let sync = &self.sync;
        let cmd_ref = &cmd;
        let (outcome, attempts) = match self
            .retrying(ctx, &line.product_id, move || sync.complete_purchase(cmd_ref))
            .await
        {
            Ok(done) => done,
            Err(failure) => {
                return self
                    .dead_letter(ctx, &line.product_id, &order.order_id, json!({"order": order, "line": line}), failure)
                    .await
            }
        };

        let mut report = ItemReport {
            product_id: line.product_id.clone(),
            order_id: order.order_id.clone(),
            status: ItemStatus::Recorded,
            attempts,
            detail: None,
            notification: None,
        };

        match (outcome.purchase, outcome.grant, issued) {
            (Transition::Stale, _, _) => {
                report.status = ItemStatus::Stale;
                report.detail = Some("a newer event already updated this purchase".into());
            }
            (_, Some(grant), Some(issued)) if grant.applied() => {
                report.status = ItemStatus::Granted;
                let notice = GrantNotice {
                    display_name: order.display_name.clone(),
                    product_id: line.product_id.clone(),
                    product_title: line.title.clone(),
                    order_id: order.order_id.clone(),
                    token: issued.token,
                    expires_at: issued.expires_at,
                };
                report.notification = Some(self.notifier.send_grant_notice(&order.email, &notice).await);
            }
            (_, Some(_), _) => {
                report.status = ItemStatus::Superseded;
                report.detail = Some("a newer grant for this product is in place".into());
            }
            _ => {}
        }
        report
    }

    async fn cancel_line(&self, ctx: &EventContext, order: &ValidatedOrder, line: &OrderLine) -> ItemReport {
        let cmd = CancelPurchase {
            user: Self::user_node(order),
            product: self.product_node(line, &order.currency),
            purchase: Self::purchase_write(order, line, PurchaseStatus::Cancelled),
            reason: REASON_ORDER_CANCELLED.to_string(),
        };
        let payload = json!({"order": order, "line": line});
        self.cancel(ctx, cmd, order.display_name.clone(), line.title.clone(), payload)
            .await
    }

    async fn cancel(
        &self,
        ctx: &EventContext,
        cmd: CancelPurchase,
        display_name: Option<String>,
        title: Option<String>,
        payload: serde_json::Value,
    ) -> ItemReport {
        let product_id = cmd.purchase.product_id.clone();
        let order_id = cmd.purchase.order_id.clone();

        let sync = &self.sync;
        let cmd_ref = &cmd;
        let (outcome, attempts) = match self
            .retrying(ctx, &product_id, move || sync.cancel_purchase(cmd_ref))
            .await
        {
            Ok(done) => done,
            Err(failure) => return self.dead_letter(ctx, &product_id, &order_id, payload, failure).await,
        };

        let mut report = ItemReport {
            product_id: product_id.clone(),
            order_id,
            status: ItemStatus::NotActive,
            attempts,
            detail: None,
            notification: None,
        };

        if outcome.purchase == Transition::Stale {
            report.status = ItemStatus::Stale;
            report.detail = Some("a newer event already updated this purchase".into());
            return report;
        }

        match outcome.revoke {
            RevokeOutcome::Revoked => {
                report.status = ItemStatus::Revoked;
                let notice = RevokeNotice {
                    display_name,
                    product_id,
                    product_title: title,
                };
                report.notification = Some(
                    self.notifier
                        .send_revoke_notice(&cmd.purchase.email, &notice, &cmd.reason)
                        .await,
                );
            }
            RevokeOutcome::NotActive => {
                report.detail = Some("no active grant".into());
            }
            RevokeOutcome::Superseded => {
                report.status = ItemStatus::Superseded;
                report.detail = Some("active grant belongs to another order".into());
            }
            RevokeOutcome::Stale => {
                report.status = ItemStatus::Stale;
                report.detail = Some("grant changed by a newer event".into());
            }
        }
        report
    }

    async fn refund(&self, ctx: &EventContext, refund: &ValidatedRefund) -> Vec<ItemReport> {
        let sync = &self.sync;
        let order_id = refund.order_id.as_str();
        let stored: Vec<PurchaseRecord> = match self
            .retrying(ctx, WHOLE_EVENT, move || sync.purchases_for_order(order_id))
            .await
        {
            Ok((records, _)) => records,
            Err(failure) => {
                return vec![
                    self.dead_letter(ctx, WHOLE_EVENT, &refund.order_id, json!({"refund": refund}), failure)
                        .await,
                ]
            }
        };

        let mut targets = Vec::new();
        let mut unresolved = Vec::new();
        if refund.product_ids.is_empty() {
            targets.extend(stored.iter().map(|p| RefundTarget {
                email: p.email.clone(),
                product_id: p.product_id.clone(),
                title: p.product_title.clone(),
                amount: p.amount,
                currency: p.currency.clone(),
                quantity: p.quantity,
            }));
            if targets.is_empty() {
                unresolved.push(WHOLE_EVENT.to_string());
            }
        } else {
            for product_id in &refund.product_ids {
                let record = stored.iter().find(|p| &p.product_id == product_id);
                let email = refund
                    .email
                    .clone()
                    .or_else(|| record.map(|p| p.email.clone()));
                match email {
                    Some(email) => targets.push(RefundTarget {
                        email,
                        product_id: product_id.clone(),
                        title: record.and_then(|p| p.product_title.clone()),
                        amount: record.map(|p| p.amount).unwrap_or(Decimal::ZERO),
                        currency: record
                            .map(|p| p.currency.clone())
                            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
                        quantity: record.map(|p| p.quantity).unwrap_or(1),
                    }),
                    None => unresolved.push(product_id.clone()),
                }
            }
        }

        let resolved = join_all(targets.iter().map(|target| {
            let cmd = CancelPurchase {
                user: UserNode::new(&target.email),
                product: ProductNode {
                    product_id: target.product_id.clone(),
                    title: None,
                    unit_price: None,
                    currency: None,
                    grants_access: self.policy.grants_access(&target.product_id),
                },
                purchase: PurchaseWrite {
                    email: target.email.clone(),
                    product_id: target.product_id.clone(),
                    order_id: refund.order_id.clone(),
                    amount: target.amount,
                    currency: target.currency.clone(),
                    quantity: target.quantity,
                    status: PurchaseStatus::Cancelled,
                    event_at: refund.event_at,
                },
                reason: REASON_REFUND_CREATED.to_string(),
            };
            let payload = json!({"refund": refund, "target": target});
            self.cancel(ctx, cmd, None, target.title.clone(), payload)
        }))
        .await;

        let mut reports = Vec::with_capacity(resolved.len() + unresolved.len());
        reports.extend(resolved);
        for item_key in unresolved {
            let failure = Failure {
                reason: "purchaser unknown: no email and no recorded purchase".into(),
                attempts: 1,
            };
            reports.push(
                self.dead_letter(ctx, &item_key, &refund.order_id, json!({"refund": refund}), failure)
                    .await,
            );
        }
        reports
    }
}

enum ParsedEvent {
    Order(ValidatedOrder),
    Refund(ValidatedRefund),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_round_trip() {
        for topic in [Topic::OrderPaid, Topic::OrderCancelled, Topic::RefundCreated] {
            assert_eq!(Topic::parse(topic.as_str()), Some(topic));
        }
        assert_eq!(Topic::parse("orders/fulfilled"), None);
    }

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(2000));
        // saturates instead of overflowing
        assert!(backoff_delay(base, 40) >= backoff_delay(base, 30));
    }

    #[test]
    fn access_policy_defaults_to_everything() {
        assert!(AccessPolicy::default().grants_access("anything"));
        let only_p1 = AccessPolicy::new(Some(HashSet::from(["P1".to_string()])));
        assert!(only_p1.grants_access("P1"));
        assert!(!only_p1.grants_access("P2"));
    }
}
