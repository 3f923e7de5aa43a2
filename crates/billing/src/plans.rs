//! Plan tiers and the price catalog
//!
//! Translates Stripe price IDs into internal plan tiers. The catalog is built
//! once from configuration at startup and never changes afterwards; checkout
//! creation uses the inverse lookup to pick a price for a tier.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::PriceIds;

/// Internal entitlement level granted to a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Print,
    Pro,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Print => "print",
            PlanTier::Pro => "pro",
        }
    }

    /// Human-readable name used in notifications
    pub fn display_name(&self) -> &'static str {
        match self {
            PlanTier::Free => "Free",
            PlanTier::Print => "Print",
            PlanTier::Pro => "Pro",
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, PlanTier::Free)
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(PlanTier::Free),
            "print" => Ok(PlanTier::Print),
            "pro" => Ok(PlanTier::Pro),
            other => Err(format!("unknown plan tier '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    #[default]
    Monthly,
    Annual,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Annual => "annual",
        }
    }
}

impl FromStr for BillingCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" | "month" => Ok(BillingCycle::Monthly),
            "annual" | "yearly" | "year" => Ok(BillingCycle::Annual),
            other => Err(format!("unknown billing cycle '{}'", other)),
        }
    }
}

/// A price ID with no entry in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("price '{price_id}' is not mapped to a plan")]
pub struct UnknownPriceError {
    pub price_id: String,
}

/// Plan and billing cycle a price grants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricedPlan {
    pub plan: PlanTier,
    pub cycle: BillingCycle,
}

/// Immutable `price_id -> (plan, cycle)` table
#[derive(Debug, Clone, Default)]
pub struct PriceCatalog {
    by_price: HashMap<String, PricedPlan>,
}

impl PriceCatalog {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, PlanTier, BillingCycle)>,
        S: Into<String>,
    {
        let by_price = entries
            .into_iter()
            .map(|(price_id, plan, cycle)| (price_id.into(), PricedPlan { plan, cycle }))
            .filter(|(price_id, _)| !price_id.is_empty())
            .collect();
        Self { by_price }
    }

    /// Build the catalog from configured price IDs, skipping unset prices
    pub fn from_price_ids(ids: &PriceIds) -> Self {
        let entries = [
            (ids.print_monthly.clone(), PlanTier::Print, BillingCycle::Monthly),
            (ids.print_annual.clone(), PlanTier::Print, BillingCycle::Annual),
            (ids.pro_monthly.clone(), PlanTier::Pro, BillingCycle::Monthly),
            (ids.pro_annual.clone(), PlanTier::Pro, BillingCycle::Annual),
        ];
        Self::new(
            entries
                .into_iter()
                .filter_map(|(id, plan, cycle)| id.map(|id| (id, plan, cycle))),
        )
    }

    pub fn map_price(&self, price_id: &str) -> Result<PricedPlan, UnknownPriceError> {
        self.by_price
            .get(price_id)
            .copied()
            .ok_or_else(|| UnknownPriceError {
                price_id: price_id.to_string(),
            })
    }

    /// Plan tier for a price ID
    pub fn plan_for_price(&self, price_id: &str) -> Result<PlanTier, UnknownPriceError> {
        self.map_price(price_id).map(|p| p.plan)
    }

    /// Inverse lookup used when creating checkout sessions. `Free` never has a price.
    pub fn price_for(&self, plan: PlanTier, cycle: BillingCycle) -> Option<&str> {
        if !plan.is_paid() {
            return None;
        }
        self.by_price
            .iter()
            .find(|(_, p)| p.plan == plan && p.cycle == cycle)
            .map(|(id, _)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_price.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_price.is_empty()
    }
}
