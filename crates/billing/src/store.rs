//! Typed persistence accessors.
//!
//! Every query that touches a tenant-owned entity is scoped by `tenant_id`.
//! Functions that participate in a processor transaction take
//! `&mut PgConnection`; single-query reads accept any executor so they work
//! from the pool directly.

use sqlx::postgres::PgConnection;
use sqlx::{FromRow, PgExecutor};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlements::{EntitlementSources, PurchaseGrant, SubscriptionGrant};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    ComputedEntitlement, EntitlementRow, EventOutcome, ManualGrant, Price, Purchase, Subscription,
    Tenant,
};

// ---------------------------------------------------------------------------
// Tenants
// ---------------------------------------------------------------------------

/// A tenant resolved through one of its credentials. The stored hash is
/// returned so the caller can confirm it in constant time.
#[derive(Debug, Clone, FromRow)]
pub struct TenantCredential {
    #[sqlx(flatten)]
    pub tenant: Tenant,
    pub credential_hash: String,
}

pub async fn find_tenant_by_credential_hash<'e>(
    executor: impl PgExecutor<'e>,
    credential_hash: &str,
) -> BillingResult<Option<TenantCredential>> {
    let row: Option<TenantCredential> = sqlx::query_as(
        r#"
        SELECT t.id, t.tenant_id, t.name, t.active, t.created_at, c.credential_hash
        FROM tenants t
        JOIN tenant_credentials c ON c.tenant_id = t.tenant_id
        WHERE c.credential_hash = $1
        "#,
    )
    .bind(credential_hash)
    .fetch_optional(executor)
    .await?;

    Ok(row)
}

pub async fn find_tenant<'e>(
    executor: impl PgExecutor<'e>,
    tenant_id: &str,
) -> BillingResult<Option<Tenant>> {
    let row: Option<Tenant> = sqlx::query_as(
        "SELECT id, tenant_id, name, active, created_at FROM tenants WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .fetch_optional(executor)
    .await?;

    Ok(row)
}

pub async fn list_active_tenants<'e>(executor: impl PgExecutor<'e>) -> BillingResult<Vec<Tenant>> {
    let rows: Vec<Tenant> = sqlx::query_as(
        "SELECT id, tenant_id, name, active, created_at FROM tenants WHERE active ORDER BY tenant_id",
    )
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

/// A price joined with its product's feature codes and archival flag.
#[derive(Debug, Clone, FromRow)]
pub struct PriceWithFeatures {
    #[sqlx(flatten)]
    pub price: Price,
    pub feature_codes: Vec<String>,
    pub tenant_id: String,
}

pub async fn find_price_by_provider_id<'e>(
    executor: impl PgExecutor<'e>,
    provider_price_id: &str,
) -> BillingResult<Option<PriceWithFeatures>> {
    let row: Option<PriceWithFeatures> = sqlx::query_as(
        r#"
        SELECT pr.id, pr.product_id, pr.provider_price_id, pr.amount_cents, pr.currency,
               pr.cadence, pr.access_duration_days, p.feature_codes, p.tenant_id
        FROM prices pr
        JOIN products p ON p.id = pr.product_id
        WHERE pr.provider_price_id = $1
        "#,
    )
    .bind(provider_price_id)
    .fetch_optional(executor)
    .await?;

    Ok(row)
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Fields written when mirroring a provider subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionChange {
    pub tenant_id: String,
    pub user_id: String,
    pub provider_subscription_id: String,
    pub price_id: Uuid,
    pub status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
}

/// Insert or overwrite the local mirror of a provider subscription.
pub async fn upsert_subscription(
    conn: &mut PgConnection,
    change: &SubscriptionChange,
    now: OffsetDateTime,
) -> BillingResult<Subscription> {
    let row: Subscription = sqlx::query_as(
        r#"
        INSERT INTO subscriptions
            (id, tenant_id, user_id, provider_subscription_id, price_id, status,
             current_period_start, current_period_end, cancel_at_period_end, canceled_at,
             created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
        ON CONFLICT (provider_subscription_id) DO UPDATE SET
            status = EXCLUDED.status,
            current_period_start = EXCLUDED.current_period_start,
            current_period_end = EXCLUDED.current_period_end,
            cancel_at_period_end = EXCLUDED.cancel_at_period_end,
            canceled_at = EXCLUDED.canceled_at,
            updated_at = EXCLUDED.updated_at
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&change.tenant_id)
    .bind(&change.user_id)
    .bind(&change.provider_subscription_id)
    .bind(change.price_id)
    .bind(&change.status)
    .bind(change.current_period_start)
    .bind(change.current_period_end)
    .bind(change.cancel_at_period_end)
    .bind(change.canceled_at)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(row)
}

/// Load a subscription and lock its row for the rest of the transaction.
pub async fn lock_subscription(
    conn: &mut PgConnection,
    provider_subscription_id: &str,
) -> BillingResult<Option<Subscription>> {
    let row: Option<Subscription> = sqlx::query_as(
        "SELECT * FROM subscriptions WHERE provider_subscription_id = $1 FOR UPDATE",
    )
    .bind(provider_subscription_id)
    .fetch_optional(conn)
    .await?;

    Ok(row)
}

pub async fn find_subscription<'e>(
    executor: impl PgExecutor<'e>,
    provider_subscription_id: &str,
) -> BillingResult<Option<Subscription>> {
    let row: Option<Subscription> =
        sqlx::query_as("SELECT * FROM subscriptions WHERE provider_subscription_id = $1")
            .bind(provider_subscription_id)
            .fetch_optional(executor)
            .await?;

    Ok(row)
}

/// Advance period and status on a locked subscription row.
pub async fn update_subscription_state(
    conn: &mut PgConnection,
    provider_subscription_id: &str,
    status: &str,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    cancel_at_period_end: bool,
    canceled_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE subscriptions
        SET status = $2, current_period_start = $3, current_period_end = $4,
            cancel_at_period_end = $5, canceled_at = $6, updated_at = $7
        WHERE provider_subscription_id = $1
        "#,
    )
    .bind(provider_subscription_id)
    .bind(status)
    .bind(current_period_start)
    .bind(current_period_end)
    .bind(cancel_at_period_end)
    .bind(canceled_at)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Purchases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PurchaseChange {
    pub tenant_id: String,
    pub user_id: String,
    pub provider_charge_id: String,
    pub price_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub valid_from: OffsetDateTime,
    pub valid_to: Option<OffsetDateTime>,
}

/// Insert a purchase; returns None when the charge is already mirrored.
pub async fn insert_purchase_if_absent(
    conn: &mut PgConnection,
    change: &PurchaseChange,
    now: OffsetDateTime,
) -> BillingResult<Option<Purchase>> {
    let row: Option<Purchase> = sqlx::query_as(
        r#"
        INSERT INTO purchases
            (id, tenant_id, user_id, provider_charge_id, price_id, amount_cents, currency,
             status, refunded_at, valid_from, valid_to, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, $9, $10, $11)
        ON CONFLICT (provider_charge_id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&change.tenant_id)
    .bind(&change.user_id)
    .bind(&change.provider_charge_id)
    .bind(change.price_id)
    .bind(change.amount_cents)
    .bind(&change.currency)
    .bind(&change.status)
    .bind(change.valid_from)
    .bind(change.valid_to)
    .bind(now)
    .fetch_optional(conn)
    .await?;

    Ok(row)
}

/// Load a purchase and lock its row for the rest of the transaction.
pub async fn lock_purchase(
    conn: &mut PgConnection,
    provider_charge_id: &str,
) -> BillingResult<Option<Purchase>> {
    let row: Option<Purchase> =
        sqlx::query_as("SELECT * FROM purchases WHERE provider_charge_id = $1 FOR UPDATE")
            .bind(provider_charge_id)
            .fetch_optional(conn)
            .await?;

    Ok(row)
}

pub async fn find_purchase<'e>(
    executor: impl PgExecutor<'e>,
    provider_charge_id: &str,
) -> BillingResult<Option<Purchase>> {
    let row: Option<Purchase> =
        sqlx::query_as("SELECT * FROM purchases WHERE provider_charge_id = $1")
            .bind(provider_charge_id)
            .fetch_optional(executor)
            .await?;

    Ok(row)
}

pub async fn mark_purchase_refunded(
    conn: &mut PgConnection,
    provider_charge_id: &str,
    refunded_at: OffsetDateTime,
) -> BillingResult<()> {
    sqlx::query(
        "UPDATE purchases SET status = 'refunded', refunded_at = $2 WHERE provider_charge_id = $1",
    )
    .bind(provider_charge_id)
    .bind(refunded_at)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn update_purchase_status(
    conn: &mut PgConnection,
    provider_charge_id: &str,
    status: &str,
    refunded_at: Option<OffsetDateTime>,
) -> BillingResult<()> {
    sqlx::query(
        "UPDATE purchases SET status = $2, refunded_at = $3 WHERE provider_charge_id = $1",
    )
    .bind(provider_charge_id)
    .bind(status)
    .bind(refunded_at)
    .execute(conn)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Manual grants
// ---------------------------------------------------------------------------

pub async fn insert_manual_grant(
    conn: &mut PgConnection,
    tenant_id: &str,
    user_id: &str,
    feature_code: &str,
    valid_from: OffsetDateTime,
    valid_to: Option<OffsetDateTime>,
    reason: &str,
    granted_by: &str,
    now: OffsetDateTime,
) -> BillingResult<ManualGrant> {
    let row: ManualGrant = sqlx::query_as(
        r#"
        INSERT INTO manual_grants
            (id, tenant_id, user_id, feature_code, valid_from, valid_to, reason, granted_by,
             granted_at, revoked_at, revoked_by, revoke_reason)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, NULL, NULL)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(tenant_id)
    .bind(user_id)
    .bind(feature_code)
    .bind(valid_from)
    .bind(valid_to)
    .bind(reason)
    .bind(granted_by)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(row)
}

/// Latest non-revoked grant for (tenant, user, feature), locked for update.
pub async fn lock_latest_active_grant(
    conn: &mut PgConnection,
    tenant_id: &str,
    user_id: &str,
    feature_code: &str,
) -> BillingResult<Option<ManualGrant>> {
    let row: Option<ManualGrant> = sqlx::query_as(
        r#"
        SELECT * FROM manual_grants
        WHERE tenant_id = $1 AND user_id = $2 AND feature_code = $3 AND revoked_at IS NULL
        ORDER BY granted_at DESC
        LIMIT 1
        FOR UPDATE
        "#,
    )
    .bind(tenant_id)
    .bind(user_id)
    .bind(feature_code)
    .fetch_optional(conn)
    .await?;

    Ok(row)
}

/// A non-revoked grant whose window still covers `now` (or is open-ended).
pub async fn find_covering_grant(
    conn: &mut PgConnection,
    tenant_id: &str,
    user_id: &str,
    feature_code: &str,
    now: OffsetDateTime,
) -> BillingResult<Option<ManualGrant>> {
    let row: Option<ManualGrant> = sqlx::query_as(
        r#"
        SELECT * FROM manual_grants
        WHERE tenant_id = $1 AND user_id = $2 AND feature_code = $3
          AND revoked_at IS NULL
          AND valid_from <= $4
          AND (valid_to IS NULL OR valid_to > $4)
        ORDER BY granted_at DESC
        LIMIT 1
        "#,
    )
    .bind(tenant_id)
    .bind(user_id)
    .bind(feature_code)
    .bind(now)
    .fetch_optional(conn)
    .await?;

    Ok(row)
}

pub async fn revoke_grant(
    conn: &mut PgConnection,
    grant_id: Uuid,
    revoked_by: &str,
    revoke_reason: Option<&str>,
    now: OffsetDateTime,
) -> BillingResult<ManualGrant> {
    let row: Option<ManualGrant> = sqlx::query_as(
        r#"
        UPDATE manual_grants
        SET revoked_at = $2, revoked_by = $3, revoke_reason = $4
        WHERE id = $1 AND revoked_at IS NULL
        RETURNING *
        "#,
    )
    .bind(grant_id)
    .bind(now)
    .bind(revoked_by)
    .bind(revoke_reason)
    .fetch_optional(conn)
    .await?;

    row.ok_or_else(|| BillingError::NotFound(format!("grant {grant_id} already revoked")))
}

// ---------------------------------------------------------------------------
// Entitlements
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
struct SubscriptionGrantRow {
    #[sqlx(flatten)]
    subscription: Subscription,
    feature_codes: Vec<String>,
}

#[derive(Debug, FromRow)]
struct PurchaseGrantRow {
    #[sqlx(flatten)]
    purchase: Purchase,
    feature_codes: Vec<String>,
}

/// Load all three entitlement sources for one (tenant, user) pair.
pub async fn load_entitlement_sources(
    conn: &mut PgConnection,
    tenant_id: &str,
    user_id: &str,
) -> BillingResult<EntitlementSources> {
    let subscriptions: Vec<SubscriptionGrantRow> = sqlx::query_as(
        r#"
        SELECT s.*, p.feature_codes
        FROM subscriptions s
        JOIN prices pr ON pr.id = s.price_id
        JOIN products p ON p.id = pr.product_id
        WHERE s.tenant_id = $1 AND s.user_id = $2
        ORDER BY s.provider_subscription_id
        "#,
    )
    .bind(tenant_id)
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    let purchases: Vec<PurchaseGrantRow> = sqlx::query_as(
        r#"
        SELECT pu.*, p.feature_codes
        FROM purchases pu
        JOIN prices pr ON pr.id = pu.price_id
        JOIN products p ON p.id = pr.product_id
        WHERE pu.tenant_id = $1 AND pu.user_id = $2
        ORDER BY pu.provider_charge_id
        "#,
    )
    .bind(tenant_id)
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    let grants: Vec<ManualGrant> = sqlx::query_as(
        r#"
        SELECT * FROM manual_grants
        WHERE tenant_id = $1 AND user_id = $2
        ORDER BY granted_at, id
        "#,
    )
    .bind(tenant_id)
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(EntitlementSources {
        subscriptions: subscriptions
            .into_iter()
            .map(|row| SubscriptionGrant {
                subscription: row.subscription,
                feature_codes: row.feature_codes,
            })
            .collect(),
        purchases: purchases
            .into_iter()
            .map(|row| PurchaseGrant {
                purchase: row.purchase,
                feature_codes: row.feature_codes,
            })
            .collect(),
        grants,
    })
}

/// Serialize recomputations for one (tenant, user) pair. The lock is held
/// until the enclosing transaction ends.
pub async fn acquire_pair_lock(
    conn: &mut PgConnection,
    tenant_id: &str,
    user_id: &str,
) -> BillingResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("ent:{tenant_id}:{user_id}"))
        .execute(conn)
        .await?;

    Ok(())
}

/// Delete and reinsert the materialized rows for one (tenant, user) pair.
pub async fn replace_entitlements(
    conn: &mut PgConnection,
    tenant_id: &str,
    user_id: &str,
    computed: &[ComputedEntitlement],
    now: OffsetDateTime,
) -> BillingResult<()> {
    sqlx::query("DELETE FROM entitlements WHERE tenant_id = $1 AND user_id = $2")
        .bind(tenant_id)
        .bind(user_id)
        .execute(&mut *conn)
        .await?;

    for entitlement in computed {
        sqlx::query(
            r#"
            INSERT INTO entitlements
                (id, tenant_id, user_id, feature_code, source, source_ref, is_active,
                 valid_from, valid_to, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7, $8, $9)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(user_id)
        .bind(&entitlement.feature_code)
        .bind(entitlement.source.as_str())
        .bind(&entitlement.source_ref)
        .bind(entitlement.valid_from)
        .bind(entitlement.valid_to)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

pub async fn load_entitlements<'e>(
    executor: impl PgExecutor<'e>,
    tenant_id: &str,
    user_id: &str,
) -> BillingResult<Vec<EntitlementRow>> {
    let rows: Vec<EntitlementRow> = sqlx::query_as(
        r#"
        SELECT * FROM entitlements
        WHERE tenant_id = $1 AND user_id = $2
        ORDER BY feature_code, source, source_ref
        "#,
    )
    .bind(tenant_id)
    .bind(user_id)
    .fetch_all(executor)
    .await?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// Raw events
// ---------------------------------------------------------------------------

/// Result of the atomic dedup claim on a raw event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventClaim {
    /// This caller owns processing; the row exists with outcome `pending`.
    Claimed,
    /// A previous delivery finished with the given outcome; reply 200.
    AlreadyProcessed { outcome: String },
}

/// Atomically claim a provider event for processing.
///
/// First delivery inserts the row. Redeliveries re-claim only rows still
/// `pending` or `failed_transient`; anything else is a duplicate.
pub async fn claim_event(
    conn: &mut PgConnection,
    provider_event_id: &str,
    event_type: &str,
    payload: &serde_json::Value,
    now: OffsetDateTime,
) -> BillingResult<EventClaim> {
    let claimed: Option<(Uuid,)> = sqlx::query_as(
        r#"
        INSERT INTO raw_events
            (id, provider_event_id, event_type, payload, received_at, processed_at,
             processing_outcome, attempt_count, last_error)
        VALUES ($1, $2, $3, $4, $5, NULL, 'pending', 1, NULL)
        ON CONFLICT (provider_event_id) DO UPDATE SET
            attempt_count = raw_events.attempt_count + 1,
            processing_outcome = 'pending'
        WHERE raw_events.processing_outcome IN ('pending', 'failed_transient')
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(provider_event_id)
    .bind(event_type)
    .bind(payload)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    if claimed.is_some() {
        return Ok(EventClaim::Claimed);
    }

    let outcome: Option<(String,)> =
        sqlx::query_as("SELECT processing_outcome FROM raw_events WHERE provider_event_id = $1")
            .bind(provider_event_id)
            .fetch_optional(&mut *conn)
            .await?;

    match outcome {
        Some((outcome,)) => Ok(EventClaim::AlreadyProcessed { outcome }),
        None => Err(BillingError::Internal(format!(
            "event {provider_event_id} vanished during claim"
        ))),
    }
}

pub async fn mark_event_outcome<'e>(
    executor: impl PgExecutor<'e>,
    provider_event_id: &str,
    outcome: EventOutcome,
    error: Option<&str>,
    now: OffsetDateTime,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE raw_events
        SET processing_outcome = $2, processed_at = $3, last_error = $4
        WHERE provider_event_id = $1
        "#,
    )
    .bind(provider_event_id)
    .bind(outcome.as_str())
    .bind(now)
    .bind(error)
    .execute(executor)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Scheduler lease
// ---------------------------------------------------------------------------

/// Best-effort leader lease: at most one holder per name until expiry.
pub async fn try_acquire_lease<'e>(
    executor: impl PgExecutor<'e>,
    name: &str,
    holder: &str,
    expires_at: OffsetDateTime,
    now: OffsetDateTime,
) -> BillingResult<bool> {
    let acquired: Option<(String,)> = sqlx::query_as(
        r#"
        INSERT INTO scheduler_leases (name, holder, expires_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (name) DO UPDATE SET holder = $2, expires_at = $3
        WHERE scheduler_leases.expires_at < $4 OR scheduler_leases.holder = $2
        RETURNING name
        "#,
    )
    .bind(name)
    .bind(holder)
    .bind(expires_at)
    .bind(now)
    .fetch_optional(executor)
    .await?;

    Ok(acquired.is_some())
}
