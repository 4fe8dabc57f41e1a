// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Entitlement State Machine
//!
//! Cross-module boundary conditions:
//! - Recomputation determinism through materialization and aggregation
//! - Multi-source precedence under expiry
//! - Cache value stability across repeated recomputation
//! - Webhook envelope handling under hostile input

mod recompute_pipeline_tests {
    use crate::entitlements::{aggregate, compute, EntitlementSources, PurchaseGrant, SubscriptionGrant};
    use crate::models::{
        AggregatedEntitlement, ComputedEntitlement, EntitlementRow, EntitlementSource, ManualGrant,
        Purchase, Subscription,
    };
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    fn at(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    /// Mirror of what `store::replace_entitlements` persists.
    fn materialize(computed: &[ComputedEntitlement], now: OffsetDateTime) -> Vec<EntitlementRow> {
        computed
            .iter()
            .map(|e| EntitlementRow {
                id: Uuid::new_v4(),
                tenant_id: "t_1".into(),
                user_id: "u_1".into(),
                feature_code: e.feature_code.clone(),
                source: e.source.as_str().into(),
                source_ref: e.source_ref.clone(),
                is_active: true,
                valid_from: e.valid_from,
                valid_to: e.valid_to,
                computed_at: now,
            })
            .collect()
    }

    fn subscription(status: &str, start: i64, end: i64) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            tenant_id: "t_1".into(),
            user_id: "u_1".into(),
            provider_subscription_id: "sub_1".into(),
            price_id: Uuid::new_v4(),
            status: status.into(),
            current_period_start: at(start),
            current_period_end: at(end),
            cancel_at_period_end: false,
            canceled_at: None,
            created_at: at(start),
            updated_at: at(start),
        }
    }

    fn purchase(status: &str, charge: &str, from: i64, to: Option<i64>) -> Purchase {
        Purchase {
            id: Uuid::new_v4(),
            tenant_id: "t_1".into(),
            user_id: "u_1".into(),
            provider_charge_id: charge.into(),
            price_id: Uuid::new_v4(),
            amount_cents: 4_999,
            currency: "usd".into(),
            status: status.into(),
            refunded_at: None,
            valid_from: at(from),
            valid_to: to.map(at),
            created_at: at(from),
        }
    }

    fn grant(feature: &str, from: i64, to: Option<i64>) -> ManualGrant {
        ManualGrant {
            id: Uuid::new_v4(),
            tenant_id: "t_1".into(),
            user_id: "u_1".into(),
            feature_code: feature.into(),
            valid_from: at(from),
            valid_to: to.map(at),
            reason: "trial extension".into(),
            granted_by: "ops@paygate".into(),
            granted_at: at(from),
            revoked_at: None,
            revoked_by: None,
            revoke_reason: None,
        }
    }

    // =========================================================================
    // Recompute then recompute with unchanged inputs yields identical rows
    // and an identical serialized cache value.
    // =========================================================================
    #[test]
    fn repeated_recompute_is_byte_identical_through_the_cache() {
        let sources = EntitlementSources {
            subscriptions: vec![SubscriptionGrant {
                subscription: subscription("active", 900_000, 1_100_000),
                feature_codes: vec!["pro".into(), "analytics".into()],
            }],
            purchases: vec![PurchaseGrant {
                purchase: purchase("succeeded", "ch_life", 500_000, None),
                feature_codes: vec!["lifetime_x".into()],
            }],
            grants: vec![grant("beta", 100_000, None)],
        };
        let now = at(1_000_000);

        let first = compute(&sources, now, Duration::ZERO);
        let second = compute(&sources, now, Duration::ZERO);
        assert_eq!(first, second);

        let view_a: Vec<AggregatedEntitlement> = aggregate(&materialize(&first, now), now);
        let view_b: Vec<AggregatedEntitlement> = aggregate(&materialize(&second, now), now);
        assert_eq!(
            serde_json::to_string(&view_a).unwrap(),
            serde_json::to_string(&view_b).unwrap()
        );
    }

    // =========================================================================
    // Refund of a lifetime purchase: the feature disappears from the
    // recomputed set entirely (replace-in-place needs no clear event).
    // =========================================================================
    #[test]
    fn refund_removes_lifetime_feature_on_recompute() {
        let now = at(1_000_000);
        let active = EntitlementSources {
            purchases: vec![PurchaseGrant {
                purchase: purchase("succeeded", "ch_1", 500_000, None),
                feature_codes: vec!["lifetime_x".into()],
            }],
            ..Default::default()
        };
        let before = compute(&active, now, Duration::ZERO);
        assert_eq!(before.len(), 1);

        let refunded = EntitlementSources {
            purchases: vec![PurchaseGrant {
                purchase: purchase("refunded", "ch_1", 500_000, None),
                feature_codes: vec!["lifetime_x".into()],
            }],
            ..Default::default()
        };
        let after = compute(&refunded, now, Duration::ZERO);
        assert!(after.is_empty());

        let view = aggregate(&materialize(&after, now), now);
        assert!(view.iter().all(|e| e.feature_code != "lifetime_x"));
    }

    // =========================================================================
    // Manual grant supersedes an expired subscription for the same feature.
    // =========================================================================
    #[test]
    fn manual_grant_supersedes_expired_subscription() {
        let now = at(1_000_000);
        let day = 86_400;
        let sources = EntitlementSources {
            subscriptions: vec![SubscriptionGrant {
                subscription: subscription("active", 1_000_000 - 31 * day, 1_000_000 - day),
                feature_codes: vec!["pro".into()],
            }],
            grants: vec![grant("pro", 999_000, Some(1_000_000 + 7 * day))],
            ..Default::default()
        };

        let computed = compute(&sources, now, Duration::ZERO);
        // Only the grant contributes: the subscription window has closed.
        assert_eq!(computed.len(), 1);
        assert_eq!(computed[0].source, EntitlementSource::Manual);

        let view = aggregate(&materialize(&computed, now), now);
        assert_eq!(view.len(), 1);
        assert!(view[0].is_active);
        assert_eq!(view[0].source, EntitlementSource::Manual);
    }

    // =========================================================================
    // All three sources for one feature: storage keeps every contributor,
    // the view collapses to the widest window.
    // =========================================================================
    #[test]
    fn storage_keeps_all_contributors_while_view_collapses() {
        let now = at(1_000_000);
        let sources = EntitlementSources {
            subscriptions: vec![SubscriptionGrant {
                subscription: subscription("active", 900_000, 1_100_000),
                feature_codes: vec!["pro".into()],
            }],
            purchases: vec![PurchaseGrant {
                purchase: purchase("succeeded", "ch_1", 500_000, None),
                feature_codes: vec!["pro".into()],
            }],
            grants: vec![grant("pro", 950_000, Some(1_050_000))],
        };

        let computed = compute(&sources, now, Duration::ZERO);
        assert_eq!(computed.len(), 3, "audits must see every source");

        let view = aggregate(&materialize(&computed, now), now);
        assert_eq!(view.len(), 1);
        // Lifetime purchase window (NULL valid_to) beats both finite windows.
        assert_eq!(view[0].source, EntitlementSource::Purchase);
        assert_eq!(view[0].valid_to, None);
    }
}

mod webhook_envelope_tests {
    use crate::error::BillingError;
    use crate::provider::types::{CheckoutSession, ProviderEvent};

    // =========================================================================
    // Envelope must carry id, type, created, and data.object.
    // =========================================================================
    #[test]
    fn envelope_without_data_object_is_rejected() {
        let body = br#"{"id":"evt_1","type":"charge.refunded","created":1700000000}"#;
        assert!(matches!(
            ProviderEvent::from_body(body),
            Err(BillingError::InvalidPayload(_))
        ));
    }

    // =========================================================================
    // Object decode failure is a permanent error, not a panic.
    // =========================================================================
    #[test]
    fn object_shape_mismatch_is_invalid_payload() {
        let body = br#"{
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1700000000,
            "data": {"object": {"mode": "subscription"}}
        }"#;
        let event = ProviderEvent::from_body(body).unwrap();

        let result: Result<CheckoutSession, _> = event.object();
        let err = result.unwrap_err();
        assert!(matches!(err, BillingError::InvalidPayload(_)));
        assert!(!err.is_transient());
    }

    // =========================================================================
    // Metadata with an empty tenant_id reads as missing, never as "".
    // =========================================================================
    #[test]
    fn empty_string_metadata_is_treated_as_missing() {
        let body = br#"{
            "id": "evt_1",
            "type": "checkout.session.completed",
            "created": 1700000000,
            "data": {"object": {"id": "cs_1", "mode": "payment",
                     "metadata": {"tenant_id": ""}}}
        }"#;
        let event = ProviderEvent::from_body(body).unwrap();
        let session: CheckoutSession = event.object().unwrap();

        assert_eq!(
            crate::models::metadata_value(&session.metadata, "tenant_id"),
            None
        );
    }
}
