//! Core domain types shared across DocuPort crates

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a subscription.
///
/// Stored as TEXT in the database; parsed with [`FromStr`]. `Cancelled` is a
/// terminal state: once a subscription is cancelled it can never become
/// `Active` again, the user must create a new subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Subscription in good standing; operations are permitted
    Active,
    /// Created but awaiting first successful payment (paid plans)
    Inactive,
    /// A renewal payment failed; reversible back to active
    PastDue,
    /// Terminal: cancelled by the user or by the billing gateway
    Cancelled,
    /// Renewal payments exhausted retries; reversible back to active
    Unpaid,
}

impl SubscriptionStatus {
    /// Only `active` grants access to new operations. All other states deny
    /// new work but must not block reads of previously stored documents.
    pub fn grants_access(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }

    /// Whether a transition to `to` is permitted from this state.
    ///
    /// `past_due` and `unpaid` are reachable only from `active` and are
    /// reversible; `cancelled` is reachable from anywhere and absorbing.
    pub fn can_transition_to(&self, to: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        match (self, to) {
            // Terminal state: nothing leaves cancelled
            (Cancelled, _) => false,
            (_, Cancelled) => true,
            // Billing-failure states only ever follow active
            (Active, PastDue) | (Active, Unpaid) => true,
            (PastDue, Active) | (Unpaid, Active) => true,
            // First successful payment activates a pending subscription
            (Inactive, Active) => true,
            (a, b) => *a == b,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Unpaid => "unpaid",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "inactive" => Ok(SubscriptionStatus::Inactive),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            // Stripe spells it with one l
            "cancelled" | "canceled" => Ok(SubscriptionStatus::Cancelled),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            other => Err(format!("Unknown subscription status: {}", other)),
        }
    }
}

/// How consumption is billed for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingModel {
    /// Local quota ledger with monthly allowance and carryover; operations are
    /// refused once the ledger is exhausted
    PrePaid,
    /// Usage is reported to the billing gateway after the fact; no local
    /// pre-authorization of capacity
    Metered,
}

impl fmt::Display for BillingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillingModel::PrePaid => write!(f, "pre_paid"),
            BillingModel::Metered => write!(f, "metered"),
        }
    }
}

impl FromStr for BillingModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre_paid" => Ok(BillingModel::PrePaid),
            "metered" => Ok(BillingModel::Metered),
            other => Err(format!("Unknown billing model: {}", other)),
        }
    }
}
