//! Credit allotment configuration
//!
//! Plan credit amounts and policy knobs are env-driven with sensible
//! defaults so self-hosted deployments work out of the box.

use crate::types::PlanType;

/// Total credits at or above this value mean "unlimited" unless overridden
pub const DEFAULT_UNLIMITED_THRESHOLD: i64 = 99_999;

/// Credit policy configuration
#[derive(Debug, Clone)]
pub struct CreditsConfig {
    /// Monthly credits granted while trialing
    pub trial_credits: i64,
    /// Monthly credits for the Standard plan
    pub standard_credits: i64,
    /// Monthly credits for the Pro plan
    pub pro_credits: i64,
    /// Totals at or above this value report an unlimited allowance
    pub unlimited_threshold: i64,
    /// Trial length in days
    pub trial_days: i64,
    /// Remaining credits reported for a user with no credit record at all.
    ///
    /// The product has no free plan, so this defaults to 0. Deployments that
    /// grandfather a small courtesy allowance can raise it; `deduct` still
    /// refuses users without a record either way.
    pub missing_record_floor: i64,
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            trial_credits: 500,
            standard_credits: 500,
            pro_credits: 100_000,
            unlimited_threshold: DEFAULT_UNLIMITED_THRESHOLD,
            trial_days: 7,
            missing_record_floor: 0,
        }
    }
}

impl CreditsConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            trial_credits: env_i64("CREDITS_TRIAL", defaults.trial_credits),
            standard_credits: env_i64("CREDITS_STANDARD", defaults.standard_credits),
            pro_credits: env_i64("CREDITS_PRO", defaults.pro_credits),
            unlimited_threshold: env_i64("CREDITS_UNLIMITED_THRESHOLD", defaults.unlimited_threshold),
            trial_days: env_i64("TRIAL_DAYS", defaults.trial_days),
            missing_record_floor: env_i64("CREDITS_MISSING_RECORD_FLOOR", defaults.missing_record_floor),
        }
    }

    /// Monthly credit allotment for a plan type.
    ///
    /// Trial grants the same allotment as the plan it previews; terminal
    /// plan types grant nothing.
    pub fn plan_credits(&self, plan_type: PlanType) -> i64 {
        match plan_type {
            PlanType::Trial => self.trial_credits,
            PlanType::Standard => self.standard_credits,
            PlanType::Pro => self.pro_credits,
            PlanType::None | PlanType::Downgraded => 0,
        }
    }

    /// Whether a stored total means "unlimited"
    pub fn is_unlimited(&self, total: i64) -> bool {
        total >= self.unlimited_threshold
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
