// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Store accessors mirror wide table rows
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Paygate Billing Core
//!
//! The entitlement state machine behind the HTTP surface:
//!
//! - **Webhooks**: signature verification, exactly-once ingestion of the
//!   provider's at-least-once event stream
//! - **Processors**: per-event-type state transitions on subscription and
//!   purchase mirrors
//! - **Entitlements**: pure recomputation of (tenant, user) access from
//!   subscriptions, one-time purchases, and manual grants
//! - **Cache**: TTL cache over the aggregated view, evicted after every
//!   state-changing commit
//! - **Reconciler**: scheduled drift repair against the provider
//! - **Grants**: operator overrides with an immutable audit trail

pub mod audit;
pub mod cache;
pub mod entitlements;
pub mod error;
pub mod grants;
pub mod invariants;
pub mod models;
pub mod processors;
pub mod provider;
pub mod reconciler;
pub mod store;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Audit
pub use audit::{AuditAction, AuditEntry, AuditLogger};

// Cache
pub use cache::{cache_key, EntitlementCache, DEFAULT_TTL};

// Entitlements
pub use entitlements::{EntitlementSources, PurchaseGrant, SubscriptionGrant};

// Error
pub use error::{BillingError, BillingResult};

// Grants
pub use grants::{GrantRequest, GrantService, RevokeRequest};

// Invariants
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation};

// Models
pub use models::{
    AggregatedEntitlement, ComputedEntitlement, EntitlementRow, EntitlementSource, EventOutcome,
    ManualGrant, Price, Product, Purchase, PurchaseStatus, RawEvent, Subscription,
    SubscriptionStatus, Tenant,
};

// Processors
pub use processors::{process_event, Processed, ProcessorContext};

// Provider
pub use provider::{HttpProviderClient, ProviderApi, ProviderEvent};

// Reconciler
pub use reconciler::{Reconciler, ReconciliationSummary, TenantReconciliation, LEASE_NAME};

// Webhooks
pub use webhooks::{verify_signature, WebhookConfig, WebhookDisposition, WebhookHandler};
