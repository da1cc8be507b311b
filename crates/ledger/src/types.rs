//! Typed credit and subscription records
//!
//! Records are stored as string-valued hash fields. All parsing and
//! formatting happens at this boundary; the rest of the crate works with
//! typed integers, enums, and dates. Stored values are parsed defensively:
//! a malformed integer or date decodes to its absent form rather than
//! failing the request.

use std::collections::HashMap;

use time::format_description::well_known::Rfc3339;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime};

const DATE_FORMAT: &[BorrowedFormatItem<'_>] = format_description!("[year]-[month]-[day]");

/// Plan type tag on a subscription record
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanType {
    Trial,
    Standard,
    Pro,
    /// No plan (record exists but grants nothing)
    None,
    /// Fully-downgraded terminal state after a pending downgrade finalizes
    Downgraded,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Trial => "TRIAL",
            PlanType::Standard => "STANDARD",
            PlanType::Pro => "PRO",
            PlanType::None => "NONE",
            PlanType::Downgraded => "DOWNGRADED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRIAL" => Some(PlanType::Trial),
            "STANDARD" => Some(PlanType::Standard),
            "PRO" => Some(PlanType::Pro),
            "NONE" => Some(PlanType::None),
            "DOWNGRADED" => Some(PlanType::Downgraded),
            _ => None,
        }
    }

    /// Human display name shown in the subscription record
    pub fn display_name(&self) -> &'static str {
        match self {
            PlanType::Trial => "Trial",
            PlanType::Standard => "Standard Plan",
            PlanType::Pro => "Pro Plan",
            PlanType::None => "No Plan",
            PlanType::Downgraded => "Downgraded",
        }
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription lifecycle status.
///
/// Exactly one status is authoritative at a time. "Will cancel at period
/// end" is an overlay flag on an `active` subscription, not a status of its
/// own, until the provider's deletion event arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    Canceling,
    Canceled,
    PastDue,
    Unpaid,
    PaymentFailed,
    SetupFailed,
    Inactive,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceling => "canceling",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::PaymentFailed => "payment_failed",
            SubscriptionStatus::SetupFailed => "setup_failed",
            SubscriptionStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "canceling" => Some(SubscriptionStatus::Canceling),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "payment_failed" => Some(SubscriptionStatus::PaymentFailed),
            "setup_failed" => Some(SubscriptionStatus::SetupFailed),
            "inactive" => Some(SubscriptionStatus::Inactive),
            _ => None,
        }
    }

    /// True for states a reconciliation pass should look at
    pub fn is_processable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active
                | SubscriptionStatus::Trialing
                | SubscriptionStatus::Canceling
                | SubscriptionStatus::Inactive
        )
    }

    /// True once the subscription is fully terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
    Day,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
            BillingInterval::Day => "day",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "month" => Some(BillingInterval::Month),
            "year" => Some(BillingInterval::Year),
            "day" => Some(BillingInterval::Day),
            _ => None,
        }
    }
}

/// Hash field names for the credit record
pub mod credit_fields {
    pub const TOTAL: &str = "total";
    pub const USED: &str = "used";
    pub const RESET_DATE: &str = "resetDate";
    pub const LAST_UPDATE: &str = "lastUpdate";
    pub const IS_TRIAL_CREDITS: &str = "isTrialCredits";
    pub const TRIAL_CANCELED: &str = "trialCanceled";
    pub const SUBSCRIPTION_DELETED: &str = "subscriptionDeleted";
    pub const DOWNGRADED_AT: &str = "downgradedAt";
    pub const PENDING_DOWNGRADE: &str = "pendingDowngrade";
    pub const NEXT_TOTAL_CREDITS: &str = "nextTotalCredits";
}

/// Hash field names for the subscription record
pub mod subscription_fields {
    pub const PLAN: &str = "plan";
    pub const PLAN_TYPE: &str = "planType";
    pub const STATUS: &str = "status";
    pub const INTERVAL: &str = "interval";
    pub const CUSTOMER_ID: &str = "customerId";
    pub const SUBSCRIPTION_ID: &str = "subscriptionId";
    pub const TRIAL_START_DATE: &str = "trialStartDate";
    pub const TRIAL_END_DATE: &str = "trialEndDate";
    pub const CANCELED_AT: &str = "canceledAt";
    pub const TRIAL_ENDED_AT: &str = "trialEndedAt";
    pub const LAST_UPDATED: &str = "lastUpdated";
    pub const CANCEL_AT_PERIOD_END: &str = "cancelAtPeriodEnd";
    pub const CURRENT_PERIOD_END: &str = "currentPeriodEnd";
}

/// Per-user credit record
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CreditRecord {
    /// Total credits grantable this period. Absent means "no credits", not
    /// "unlimited" and not some default.
    pub total: Option<i64>,
    /// Credits consumed this period
    pub used: i64,
    /// When the next refresh is due. `None` means no scheduled refresh
    /// (terminal records) or an unparseable stored date (treated as due now).
    pub reset_date: Option<Date>,
    /// Last mutation time, informational
    pub last_update: Option<OffsetDateTime>,
    /// Allotment was granted by a trial
    pub is_trial_credits: bool,
    /// User explicitly canceled their trial
    pub trial_canceled: bool,
    /// Provider reported the subscription deleted
    pub subscription_deleted: bool,
    /// When a downgrade was finalized
    pub downgraded_at: Option<OffsetDateTime>,
    /// A plan downgrade is staged and waiting for the next rollover
    pub pending_downgrade: bool,
    /// Staged total for a pending downgrade
    pub next_total_credits: Option<i64>,
}

impl CreditRecord {
    /// Decode a stored hash. Returns `None` for a missing (empty) record.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        Some(Self {
            total: get_i64(fields, credit_fields::TOTAL),
            used: get_i64(fields, credit_fields::USED).unwrap_or(0),
            reset_date: fields
                .get(credit_fields::RESET_DATE)
                .and_then(|s| parse_date(s)),
            last_update: fields
                .get(credit_fields::LAST_UPDATE)
                .and_then(|s| parse_timestamp(s)),
            is_trial_credits: get_flag(fields, credit_fields::IS_TRIAL_CREDITS),
            trial_canceled: get_flag(fields, credit_fields::TRIAL_CANCELED),
            subscription_deleted: get_flag(fields, credit_fields::SUBSCRIPTION_DELETED),
            downgraded_at: fields
                .get(credit_fields::DOWNGRADED_AT)
                .and_then(|s| parse_timestamp(s)),
            pending_downgrade: get_flag(fields, credit_fields::PENDING_DOWNGRADE),
            next_total_credits: get_i64(fields, credit_fields::NEXT_TOTAL_CREDITS),
        })
    }

    /// Encode to stored hash fields
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(total) = self.total {
            out.push((credit_fields::TOTAL.to_string(), total.to_string()));
        }
        out.push((credit_fields::USED.to_string(), self.used.to_string()));
        out.push((
            credit_fields::RESET_DATE.to_string(),
            self.reset_date.map(format_date).unwrap_or_default(),
        ));
        if let Some(ts) = self.last_update {
            out.push((credit_fields::LAST_UPDATE.to_string(), format_timestamp(ts)));
        }
        push_flag(&mut out, credit_fields::IS_TRIAL_CREDITS, self.is_trial_credits);
        push_flag(&mut out, credit_fields::TRIAL_CANCELED, self.trial_canceled);
        push_flag(
            &mut out,
            credit_fields::SUBSCRIPTION_DELETED,
            self.subscription_deleted,
        );
        if let Some(ts) = self.downgraded_at {
            out.push((credit_fields::DOWNGRADED_AT.to_string(), format_timestamp(ts)));
        }
        push_flag(&mut out, credit_fields::PENDING_DOWNGRADE, self.pending_downgrade);
        if let Some(next) = self.next_total_credits {
            out.push((
                credit_fields::NEXT_TOTAL_CREDITS.to_string(),
                next.to_string(),
            ));
        }
        out
    }

    /// Any explicit cancellation signal present on this record
    pub fn has_cancellation_marker(&self) -> bool {
        self.trial_canceled || self.subscription_deleted
    }
}

/// Per-user subscription record
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SubscriptionRecord {
    /// Human display name, e.g. "Standard Plan"
    pub plan: String,
    pub plan_type: PlanType,
    pub status: SubscriptionStatus,
    pub interval: Option<BillingInterval>,
    /// Billing provider customer id; `None` for legacy users
    pub customer_id: Option<String>,
    /// Billing provider subscription id; `None` for legacy users
    pub subscription_id: Option<String>,
    pub trial_start_date: Option<OffsetDateTime>,
    pub trial_end_date: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub trial_ended_at: Option<OffsetDateTime>,
    pub last_updated: Option<OffsetDateTime>,
    /// Overlay on `active`: the provider will cancel at period end
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<OffsetDateTime>,
}

impl SubscriptionRecord {
    /// Decode a stored hash. Returns `None` for a missing (empty) record.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        Some(Self {
            plan: fields
                .get(subscription_fields::PLAN)
                .cloned()
                .unwrap_or_default(),
            plan_type: fields
                .get(subscription_fields::PLAN_TYPE)
                .and_then(|s| PlanType::parse(s))
                .unwrap_or(PlanType::None),
            status: fields
                .get(subscription_fields::STATUS)
                .and_then(|s| SubscriptionStatus::parse(s))
                .unwrap_or(SubscriptionStatus::Inactive),
            interval: fields
                .get(subscription_fields::INTERVAL)
                .and_then(|s| BillingInterval::parse(s)),
            customer_id: get_id(fields, subscription_fields::CUSTOMER_ID),
            subscription_id: get_id(fields, subscription_fields::SUBSCRIPTION_ID),
            trial_start_date: get_ts(fields, subscription_fields::TRIAL_START_DATE),
            trial_end_date: get_ts(fields, subscription_fields::TRIAL_END_DATE),
            canceled_at: get_ts(fields, subscription_fields::CANCELED_AT),
            trial_ended_at: get_ts(fields, subscription_fields::TRIAL_ENDED_AT),
            last_updated: get_ts(fields, subscription_fields::LAST_UPDATED),
            cancel_at_period_end: get_flag(fields, subscription_fields::CANCEL_AT_PERIOD_END),
            current_period_end: get_ts(fields, subscription_fields::CURRENT_PERIOD_END),
        })
    }

    /// Encode to stored hash fields
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut out = vec![
            (subscription_fields::PLAN.to_string(), self.plan.clone()),
            (
                subscription_fields::PLAN_TYPE.to_string(),
                self.plan_type.as_str().to_string(),
            ),
            (
                subscription_fields::STATUS.to_string(),
                self.status.as_str().to_string(),
            ),
            (
                subscription_fields::CUSTOMER_ID.to_string(),
                self.customer_id.clone().unwrap_or_default(),
            ),
            (
                subscription_fields::SUBSCRIPTION_ID.to_string(),
                self.subscription_id.clone().unwrap_or_default(),
            ),
            (
                subscription_fields::CANCEL_AT_PERIOD_END.to_string(),
                self.cancel_at_period_end.to_string(),
            ),
        ];
        if let Some(interval) = self.interval {
            out.push((
                subscription_fields::INTERVAL.to_string(),
                interval.as_str().to_string(),
            ));
        }
        push_ts(&mut out, subscription_fields::TRIAL_START_DATE, self.trial_start_date);
        push_ts(&mut out, subscription_fields::TRIAL_END_DATE, self.trial_end_date);
        push_ts(&mut out, subscription_fields::CANCELED_AT, self.canceled_at);
        push_ts(&mut out, subscription_fields::TRIAL_ENDED_AT, self.trial_ended_at);
        push_ts(&mut out, subscription_fields::LAST_UPDATED, self.last_updated);
        push_ts(
            &mut out,
            subscription_fields::CURRENT_PERIOD_END,
            self.current_period_end,
        );
        out
    }
}

/// Partial subscription update. Only fields a caller sets are written, so
/// replaying the same provider event merges to the same end state.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub plan: Option<String>,
    pub plan_type: Option<PlanType>,
    pub status: Option<SubscriptionStatus>,
    pub interval: Option<BillingInterval>,
    /// `Some(String::new())` clears the stored id
    pub customer_id: Option<String>,
    /// `Some(String::new())` clears the stored id
    pub subscription_id: Option<String>,
    pub trial_start_date: Option<OffsetDateTime>,
    pub trial_end_date: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub trial_ended_at: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
    pub current_period_end: Option<OffsetDateTime>,
}

impl SubscriptionPatch {
    pub fn status(status: SubscriptionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_fields().is_empty()
    }

    /// Fields to write, excluding anything unset
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(plan) = &self.plan {
            out.push((subscription_fields::PLAN.to_string(), plan.clone()));
        }
        if let Some(plan_type) = self.plan_type {
            out.push((
                subscription_fields::PLAN_TYPE.to_string(),
                plan_type.as_str().to_string(),
            ));
        }
        if let Some(status) = self.status {
            out.push((
                subscription_fields::STATUS.to_string(),
                status.as_str().to_string(),
            ));
        }
        if let Some(interval) = self.interval {
            out.push((
                subscription_fields::INTERVAL.to_string(),
                interval.as_str().to_string(),
            ));
        }
        if let Some(customer_id) = &self.customer_id {
            out.push((
                subscription_fields::CUSTOMER_ID.to_string(),
                customer_id.clone(),
            ));
        }
        if let Some(subscription_id) = &self.subscription_id {
            out.push((
                subscription_fields::SUBSCRIPTION_ID.to_string(),
                subscription_id.clone(),
            ));
        }
        push_ts(&mut out, subscription_fields::TRIAL_START_DATE, self.trial_start_date);
        push_ts(&mut out, subscription_fields::TRIAL_END_DATE, self.trial_end_date);
        push_ts(&mut out, subscription_fields::CANCELED_AT, self.canceled_at);
        push_ts(&mut out, subscription_fields::TRIAL_ENDED_AT, self.trial_ended_at);
        if let Some(flag) = self.cancel_at_period_end {
            out.push((
                subscription_fields::CANCEL_AT_PERIOD_END.to_string(),
                flag.to_string(),
            ));
        }
        push_ts(
            &mut out,
            subscription_fields::CURRENT_PERIOD_END,
            self.current_period_end,
        );
        out
    }
}

/// Parse a date-only ISO field. Malformed input decodes as `None`, which
/// reconciliation treats as "due now" (refreshing early is the safe default).
pub fn parse_date(s: &str) -> Option<Date> {
    if s.is_empty() {
        return None;
    }
    Date::parse(s, DATE_FORMAT).ok()
}

/// Format a date-only ISO field
pub fn format_date(date: Date) -> String {
    date.format(DATE_FORMAT).unwrap_or_default()
}

pub fn parse_timestamp(s: &str) -> Option<OffsetDateTime> {
    if s.is_empty() {
        return None;
    }
    OffsetDateTime::parse(s, &Rfc3339).ok()
}

pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

/// Advance a reset date to the next due date after `today`, preserving the
/// user's anchor day-of-month. With no previous reset date the anchor is
/// today's day. Day 31 anchors clamp to shorter months without drifting.
pub fn advance_reset_date(previous: Option<Date>, today: Date) -> Date {
    let anchor_day = previous.map(|d| d.day()).unwrap_or_else(|| today.day());
    let mut next = previous.unwrap_or(today);
    loop {
        next = add_month_clamped(next, anchor_day);
        if next > today {
            return next;
        }
    }
}

fn add_month_clamped(date: Date, anchor_day: u8) -> Date {
    let (year, month) = if date.month() == Month::December {
        (date.year() + 1, Month::January)
    } else {
        (date.year(), date.month().next())
    };
    let day = anchor_day.min(time::util::days_in_month(month, year));
    // Day is clamped to the target month, so construction cannot fail.
    Date::from_calendar_date(year, month, day).unwrap_or(date)
}

fn get_i64(fields: &HashMap<String, String>, key: &str) -> Option<i64> {
    fields.get(key).and_then(|v| v.parse().ok())
}

fn get_flag(fields: &HashMap<String, String>, key: &str) -> bool {
    fields.get(key).map(|v| v == "true").unwrap_or(false)
}

fn get_id(fields: &HashMap<String, String>, key: &str) -> Option<String> {
    fields.get(key).filter(|v| !v.is_empty()).cloned()
}

fn get_ts(fields: &HashMap<String, String>, key: &str) -> Option<OffsetDateTime> {
    fields.get(key).and_then(|s| parse_timestamp(s))
}

fn push_flag(out: &mut Vec<(String, String)>, key: &str, value: bool) {
    if value {
        out.push((key.to_string(), "true".to_string()));
    }
}

fn push_ts(out: &mut Vec<(String, String)>, key: &str, value: Option<OffsetDateTime>) {
    if let Some(ts) = value {
        out.push((key.to_string(), format_timestamp(ts)));
    }
}
