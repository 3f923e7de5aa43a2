// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Webhook Reconciliation
//!
//! End-to-end scenarios through signature verification, the ledger, identity
//! resolution and the reconciler:
//! - Duplicate and concurrent deliveries
//! - Out-of-order subscription events
//! - Cancellation and reactivation
//! - Notification isolation

#[cfg(test)]
mod delivery_tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::Barrier;

    use crate::plans::PlanTier;
    use crate::profiles::ProfileStore;
    use crate::reconcile::ReconciliationOutcome;
    use crate::testing::{signed, Harness, WEBHOOK_SECRET};
    use crate::webhooks::WebhookOutcome;

    fn checkout_completed(event_id: &str) -> serde_json::Value {
        json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "created": 1700000000,
            "data": {"object": {
                "id": "cs_1",
                "customer": "cus_1",
                "subscription": "sub_1",
                "customer_email": "u1@example.com",
                "metadata": {"user_id": "u1", "plan": "pro"}
            }}
        })
    }

    // =========================================================================
    // The same checkout delivered twice mutates the profile once
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_delivered_twice_writes_once() {
        let harness = Harness::new();
        let (body, header) = signed(WEBHOOK_SECRET, &checkout_completed("evt_1"));

        let first = harness.handler.handle(&body, Some(&header)).await.unwrap();
        let second = harness.handler.handle(&body, Some(&header)).await.unwrap();

        assert!(matches!(first, WebhookOutcome::Reconciled(_)));
        assert!(matches!(second, WebhookOutcome::Duplicate { .. }));
        assert_eq!(harness.profiles.write_count(), 1);

        let profile = harness.profiles.find_by_user_id("u1").await.unwrap().unwrap();
        assert_eq!(profile.plan, PlanTier::Pro);
        assert_eq!(profile.subscription_status.as_deref(), Some("active"));

        // One activation email, not two
        assert!(harness.wait_for_emails(1).await);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(harness.sender.sent_count(), 1);
    }

    // =========================================================================
    // Replaying one event N times: one mutation, N-1 no-ops
    // =========================================================================
    #[tokio::test]
    async fn test_replay_n_times() {
        let harness = Harness::new();
        let (body, header) = signed(WEBHOOK_SECRET, &checkout_completed("evt_replay"));

        let mut duplicates = 0;
        for _ in 0..25 {
            if let WebhookOutcome::Duplicate { .. } =
                harness.handler.handle(&body, Some(&header)).await.unwrap()
            {
                duplicates += 1;
            }
        }

        assert_eq!(duplicates, 24);
        assert_eq!(harness.profiles.write_count(), 1);
        assert_eq!(harness.ledger.get("evt_replay").await.unwrap().attempts, 1);
    }

    // =========================================================================
    // Concurrent deliveries race on the claim; exactly one reconciles
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_duplicate_deliveries() {
        let harness = Arc::new(Harness::new());
        let (body, header) = signed(WEBHOOK_SECRET, &checkout_completed("evt_race"));
        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];

        for _ in 0..10 {
            let harness = Arc::clone(&harness);
            let barrier = Arc::clone(&barrier);
            let body = body.clone();
            let header = header.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                harness.handler.handle(&body, Some(&header)).await.unwrap()
            }));
        }

        let mut reconciled = 0;
        for handle in handles {
            if let WebhookOutcome::Reconciled(_) = handle.await.unwrap() {
                reconciled += 1;
            }
        }

        assert_eq!(reconciled, 1, "Exactly one delivery should win the claim");
        assert_eq!(harness.profiles.write_count(), 1);
    }

    // =========================================================================
    // A retryable failure leaves the event re-claimable for the redelivery
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_after_outage_converges() {
        let harness = Harness::new();
        let (body, header) = signed(WEBHOOK_SECRET, &checkout_completed("evt_outage"));

        harness.profiles.set_failing(true);
        assert!(harness.handler.handle(&body, Some(&header)).await.is_err());
        assert_eq!(harness.sender.sent_count(), 0);

        harness.profiles.set_failing(false);
        let outcome = harness.handler.handle(&body, Some(&header)).await.unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Reconciled(ReconciliationOutcome::Applied { plan: PlanTier::Pro, .. })
        ));
    }
}

#[cfg(test)]
mod ordering_tests {
    use serde_json::json;
    use time::macros::datetime;
    use time::OffsetDateTime;

    use crate::plans::PlanTier;
    use crate::profiles::{ProfileStore, UserProfile};
    use crate::reconcile::ReconciliationOutcome;
    use crate::testing::{signed, Harness, PRINT_MONTHLY, PRO_MONTHLY, WEBHOOK_SECRET};
    use crate::webhooks::WebhookOutcome;

    const T: OffsetDateTime = datetime!(2025-03-01 0:00 UTC);

    async fn seed_pro(harness: &Harness) {
        let mut profile = UserProfile::new("u1", Some("u1@example.com".to_string()));
        profile.plan = PlanTier::Pro;
        profile.provider_customer_id = Some("cus_1".to_string());
        profile.provider_subscription_id = Some("sub_1".to_string());
        profile.subscription_status = Some("active".to_string());
        profile.current_period_end = Some(T);
        harness.profiles.inner().insert(profile).await;
    }

    fn subscription_event(
        event_id: &str,
        event_type: &str,
        subscription_id: &str,
        status: &str,
        price: &str,
        period_end: Option<i64>,
    ) -> serde_json::Value {
        json!({
            "id": event_id,
            "type": event_type,
            "created": 1700000000,
            "data": {"object": {
                "id": subscription_id,
                "customer": "cus_1",
                "status": status,
                "current_period_end": period_end,
                "cancel_at_period_end": false,
                "items": {"data": [{"price": {"id": price}}]}
            }}
        })
    }

    async fn deliver(harness: &Harness, value: serde_json::Value) -> WebhookOutcome {
        let (body, header) = signed(WEBHOOK_SECRET, &value);
        harness.handler.handle(&body, Some(&header)).await.unwrap()
    }

    // =========================================================================
    // Deletion of {plan: pro, period_end: T} keeps T as the grace boundary
    // =========================================================================
    #[tokio::test]
    async fn test_deletion_keeps_period_end() {
        let harness = Harness::new();
        seed_pro(&harness).await;

        deliver(
            &harness,
            json!({
                "id": "evt_del",
                "type": "customer.subscription.deleted",
                "data": {"object": {"id": "sub_1", "customer": "cus_1", "status": "canceled"}}
            }),
        )
        .await;

        let profile = harness.profiles.find_by_user_id("u1").await.unwrap().unwrap();
        assert_eq!(profile.plan, PlanTier::Free);
        assert_eq!(profile.subscription_status.as_deref(), Some("canceled"));
        assert_eq!(profile.current_period_end, Some(T));
    }

    // =========================================================================
    // An update delivered after a newer one does not move the period back
    // =========================================================================
    #[tokio::test]
    async fn test_out_of_order_updates() {
        let harness = Harness::new();
        seed_pro(&harness).await;
        let later = datetime!(2025-04-01 0:00 UTC);

        deliver(
            &harness,
            subscription_event(
                "evt_new",
                "customer.subscription.updated",
                "sub_1",
                "active",
                PRO_MONTHLY,
                Some(later.unix_timestamp()),
            ),
        )
        .await;
        deliver(
            &harness,
            subscription_event(
                "evt_old",
                "customer.subscription.updated",
                "sub_1",
                "active",
                PRO_MONTHLY,
                Some(T.unix_timestamp()),
            ),
        )
        .await;

        let profile = harness.profiles.find_by_user_id("u1").await.unwrap().unwrap();
        assert_eq!(profile.current_period_end, Some(later));
    }

    // =========================================================================
    // Cancellation is terminal for its subscription
    // =========================================================================
    #[tokio::test]
    async fn test_update_after_cancellation_is_skipped() {
        let harness = Harness::new();
        seed_pro(&harness).await;

        deliver(
            &harness,
            subscription_event(
                "evt_del",
                "customer.subscription.deleted",
                "sub_1",
                "canceled",
                PRO_MONTHLY,
                None,
            ),
        )
        .await;
        let late = deliver(
            &harness,
            subscription_event(
                "evt_late",
                "customer.subscription.updated",
                "sub_1",
                "active",
                PRO_MONTHLY,
                None,
            ),
        )
        .await;

        assert_eq!(late.ledger_status().map(|s| s.as_str()), Some("success"));
        let profile = harness.profiles.find_by_user_id("u1").await.unwrap().unwrap();
        assert_eq!(profile.plan, PlanTier::Free);
        assert_eq!(profile.subscription_status.as_deref(), Some("canceled"));
    }

    // =========================================================================
    // A checkout retried after its subscription was deleted stays canceled
    // =========================================================================
    #[tokio::test]
    async fn test_late_checkout_after_deletion_stays_free() {
        let harness = Harness::new();
        seed_pro(&harness).await;

        deliver(
            &harness,
            json!({
                "id": "evt_del",
                "type": "customer.subscription.deleted",
                "data": {"object": {"id": "sub_1", "customer": "cus_1", "status": "canceled"}}
            }),
        )
        .await;
        let outcome = deliver(
            &harness,
            json!({
                "id": "evt_checkout",
                "type": "checkout.session.completed",
                "created": 1700000000,
                "data": {"object": {
                    "id": "cs_1",
                    "customer": "cus_1",
                    "subscription": "sub_1",
                    "customer_email": "u1@example.com",
                    "metadata": {"user_id": "u1", "plan": "pro"}
                }}
            }),
        )
        .await;

        assert!(matches!(
            outcome,
            WebhookOutcome::Reconciled(ReconciliationOutcome::NoChange { .. })
        ));
        let profile = harness.profiles.find_by_user_id("u1").await.unwrap().unwrap();
        assert_eq!(profile.plan, PlanTier::Free);
        assert_eq!(profile.subscription_status.as_deref(), Some("canceled"));
        assert!(!harness.wait_for_emails(1).await);
    }

    // =========================================================================
    // A new checkout reactivates a canceled user on a new subscription
    // =========================================================================
    #[tokio::test]
    async fn test_reactivation_with_new_subscription() {
        let harness = Harness::new();
        seed_pro(&harness).await;

        deliver(
            &harness,
            subscription_event(
                "evt_del",
                "customer.subscription.deleted",
                "sub_1",
                "canceled",
                PRO_MONTHLY,
                None,
            ),
        )
        .await;
        deliver(
            &harness,
            json!({
                "id": "evt_checkout",
                "type": "checkout.session.completed",
                "data": {"object": {
                    "id": "cs_2",
                    "customer": "cus_1",
                    "subscription": "sub_2",
                    "client_reference_id": "u1",
                    "metadata": {"user_id": "u1", "plan": "print"}
                }}
            }),
        )
        .await;
        deliver(
            &harness,
            subscription_event(
                "evt_created",
                "customer.subscription.created",
                "sub_2",
                "active",
                PRINT_MONTHLY,
                None,
            ),
        )
        .await;

        let profile = harness.profiles.find_by_user_id("u1").await.unwrap().unwrap();
        assert_eq!(profile.plan, PlanTier::Print);
        assert_eq!(profile.subscription_status.as_deref(), Some("active"));
        assert_eq!(profile.provider_subscription_id.as_deref(), Some("sub_2"));
    }

    // =========================================================================
    // Subscription events reach the user through the customer ID alone
    // =========================================================================
    #[tokio::test]
    async fn test_subscription_event_resolves_by_customer() {
        let harness = Harness::new();
        seed_pro(&harness).await;

        let outcome = deliver(
            &harness,
            subscription_event(
                "evt_downgrade",
                "customer.subscription.updated",
                "sub_1",
                "active",
                PRINT_MONTHLY,
                None,
            ),
        )
        .await;

        assert!(matches!(outcome, WebhookOutcome::Reconciled(_)));
        let profile = harness.profiles.find_by_user_id("u1").await.unwrap().unwrap();
        assert_eq!(profile.plan, PlanTier::Print);
        // Only checkouts send the activation email
        assert_eq!(harness.sender.sent_count(), 0);
    }

    // =========================================================================
    // Email fallback links the customer for every later event
    // =========================================================================
    #[tokio::test]
    async fn test_invoice_resolves_by_email_then_customer() {
        let harness = Harness::new();
        harness
            .profiles
            .inner()
            .insert(UserProfile::new("u7", Some("Seven@Example.com".to_string())))
            .await;

        deliver(
            &harness,
            json!({
                "id": "evt_inv",
                "type": "invoice.paid",
                "data": {"object": {
                    "id": "in_1",
                    "customer": "cus_7",
                    "customer_email": "seven@example.com",
                    "lines": {"data": [{"price": {"id": PRO_MONTHLY}, "period": {"end": 1800000000}}]}
                }}
            }),
        )
        .await;

        let profile = harness.profiles.find_by_customer_id("cus_7").await.unwrap().unwrap();
        assert_eq!(profile.user_id, "u7");
        // Invoices never set the plan of an existing profile
        assert_eq!(profile.plan, PlanTier::Free);
        assert_eq!(
            profile.current_period_end.map(|t| t.unix_timestamp()),
            Some(1_800_000_000)
        );
    }
}
