//! Canonical subscription state per user
//!
//! [`ProfileStore`] is the only path to the `profiles` table. Writes go
//! through [`ProfileStore::apply_change`], which applies a [`ProfileChange`]
//! as a single conditional upsert so the period-end ordering check holds even
//! when two events for the same user race.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::BillingResult;
use crate::plans::PlanTier;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserProfile {
    pub user_id: String,
    pub email: Option<String>,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub plan: PlanTier,
    pub subscription_status: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub updated_at: OffsetDateTime,
}

impl UserProfile {
    /// A free profile with no provider linkage, as created at signup
    pub fn new(user_id: impl Into<String>, email: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email,
            provider_customer_id: None,
            provider_subscription_id: None,
            plan: PlanTier::Free,
            subscription_status: None,
            current_period_end: None,
            cancel_at_period_end: false,
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

/// A period-end write and whether it bypasses the ordering check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodEndWrite {
    pub value: OffsetDateTime,
    /// Cancellations always win regardless of the stored value
    pub force: bool,
}

impl PeriodEndWrite {
    pub fn guarded(value: OffsetDateTime) -> Self {
        Self { value, force: false }
    }

    pub fn forced(value: OffsetDateTime) -> Self {
        Self { value, force: true }
    }

    /// Accept when forced, when nothing is stored, or when not moving backwards
    pub fn accepts(&self, stored: Option<OffsetDateTime>) -> bool {
        match stored {
            _ if self.force => true,
            None => true,
            Some(stored) => self.value >= stored,
        }
    }
}

/// Field writes for one reconciliation. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileChange {
    pub email: Option<String>,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub plan: Option<PlanTier>,
    pub subscription_status: Option<String>,
    pub current_period_end: Option<PeriodEndWrite>,
    pub cancel_at_period_end: Option<bool>,
}

impl ProfileChange {
    pub fn is_empty(&self) -> bool {
        *self == ProfileChange::default()
    }

    /// Apply to an in-memory profile, enforcing the period-end ordering check
    pub fn apply_to(&self, profile: &mut UserProfile) {
        if let Some(email) = &self.email {
            profile.email = Some(email.clone());
        }
        if let Some(customer_id) = &self.provider_customer_id {
            profile.provider_customer_id = Some(customer_id.clone());
        }
        if let Some(subscription_id) = &self.provider_subscription_id {
            profile.provider_subscription_id = Some(subscription_id.clone());
        }
        if let Some(plan) = self.plan {
            profile.plan = plan;
        }
        if let Some(status) = &self.subscription_status {
            profile.subscription_status = Some(status.clone());
        }
        if let Some(write) = self.current_period_end {
            if write.accepts(profile.current_period_end) {
                profile.current_period_end = Some(write.value);
            }
        }
        if let Some(cancel) = self.cancel_at_period_end {
            profile.cancel_at_period_end = cancel;
        }
        profile.updated_at = OffsetDateTime::now_utc();
    }
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Option<UserProfile>>;

    async fn find_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<UserProfile>>;

    /// Case-insensitive email lookup
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<UserProfile>>;

    /// Link a provider customer to an existing profile
    async fn assign_customer_id(&self, user_id: &str, customer_id: &str) -> BillingResult<()>;

    /// Create the profile if missing, then apply `change` atomically
    async fn apply_change(&self, user_id: &str, change: &ProfileChange)
        -> BillingResult<UserProfile>;
}

// ============ IN-MEMORY STORE ============

/// Profile store for tests and local development without Postgres
#[derive(Default)]
pub struct InMemoryProfileStore {
    profiles: Mutex<HashMap<String, UserProfile>>,
    writes: AtomicUsize,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a profile (e.g. one created at signup)
    pub async fn insert(&self, profile: UserProfile) {
        self.profiles
            .lock()
            .await
            .insert(profile.user_id.clone(), profile);
    }

    /// Number of mutating calls that reached the store
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Option<UserProfile>> {
        Ok(self.profiles.lock().await.get(user_id).cloned())
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<UserProfile>> {
        Ok(self
            .profiles
            .lock()
            .await
            .values()
            .find(|p| p.provider_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<UserProfile>> {
        Ok(self
            .profiles
            .lock()
            .await
            .values()
            .find(|p| {
                p.email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
            })
            .cloned())
    }

    async fn assign_customer_id(&self, user_id: &str, customer_id: &str) -> BillingResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(profile) = self.profiles.lock().await.get_mut(user_id) {
            profile.provider_customer_id = Some(customer_id.to_string());
            profile.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn apply_change(
        &self,
        user_id: &str,
        change: &ProfileChange,
    ) -> BillingResult<UserProfile> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut profiles = self.profiles.lock().await;
        let profile = profiles
            .entry(user_id.to_string())
            .or_insert_with(|| UserProfile::new(user_id, None));
        change.apply_to(profile);
        Ok(profile.clone())
    }
}

// ============ POSTGRES STORE ============

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    user_id: String,
    email: Option<String>,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    plan: String,
    subscription_status: Option<String>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    updated_at: OffsetDateTime,
}

impl From<ProfileRow> for UserProfile {
    fn from(row: ProfileRow) -> Self {
        let plan = row.plan.parse().unwrap_or_else(|e| {
            tracing::error!(
                user_id = %row.user_id,
                plan = %row.plan,
                error = %e,
                "Stored plan is not a known tier, treating as free"
            );
            PlanTier::Free
        });
        Self {
            user_id: row.user_id,
            email: row.email,
            provider_customer_id: row.stripe_customer_id,
            provider_subscription_id: row.stripe_subscription_id,
            plan,
            subscription_status: row.subscription_status,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            updated_at: row.updated_at,
        }
    }
}

const PROFILE_COLUMNS: &str = "user_id, email, stripe_customer_id, stripe_subscription_id, plan, \
     subscription_status, current_period_end, cancel_at_period_end, updated_at";

/// Postgres-backed profile store
#[derive(Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_one(&self, filter: &str, value: &str) -> BillingResult<Option<UserProfile>> {
        let sql = format!(
            "SELECT {} FROM profiles WHERE {} ORDER BY updated_at DESC LIMIT 1",
            PROFILE_COLUMNS, filter
        );
        let row: Option<ProfileRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(UserProfile::from))
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Option<UserProfile>> {
        self.find_one("user_id = $1", user_id).await
    }

    async fn find_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<UserProfile>> {
        self.find_one("stripe_customer_id = $1", customer_id).await
    }

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<UserProfile>> {
        self.find_one("lower(email) = lower($1)", email).await
    }

    async fn assign_customer_id(&self, user_id: &str, customer_id: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE profiles SET stripe_customer_id = $2, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_change(
        &self,
        user_id: &str,
        change: &ProfileChange,
    ) -> BillingResult<UserProfile> {
        let period_end = change.current_period_end.map(|w| w.value);
        let force_period_end = change.current_period_end.is_some_and(|w| w.force);

        // The CASE on current_period_end is the ordering check: an older value
        // never replaces a newer one unless the write is forced.
        let sql = format!(
            r#"
            INSERT INTO profiles (
                user_id, email, stripe_customer_id, stripe_subscription_id, plan,
                subscription_status, current_period_end, cancel_at_period_end, updated_at
            )
            VALUES ($1, $2, $3, $4, COALESCE($5, 'free'), $6, $7, COALESCE($8, FALSE), NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                email = COALESCE($2, profiles.email),
                stripe_customer_id = COALESCE($3, profiles.stripe_customer_id),
                stripe_subscription_id = COALESCE($4, profiles.stripe_subscription_id),
                plan = COALESCE($5, profiles.plan),
                subscription_status = COALESCE($6, profiles.subscription_status),
                current_period_end = CASE
                    WHEN $7::TIMESTAMPTZ IS NULL THEN profiles.current_period_end
                    WHEN $9 OR profiles.current_period_end IS NULL
                        OR $7::TIMESTAMPTZ >= profiles.current_period_end THEN $7::TIMESTAMPTZ
                    ELSE profiles.current_period_end
                END,
                cancel_at_period_end = COALESCE($8, profiles.cancel_at_period_end),
                updated_at = NOW()
            RETURNING {}
            "#,
            PROFILE_COLUMNS
        );

        let row: ProfileRow = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(change.email.as_deref())
            .bind(change.provider_customer_id.as_deref())
            .bind(change.provider_subscription_id.as_deref())
            .bind(change.plan.map(|p| p.as_str()))
            .bind(change.subscription_status.as_deref())
            .bind(period_end)
            .bind(change.cancel_at_period_end)
            .bind(force_period_end)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.into())
    }
}
