use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Plan label stored in `users.account_type`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlanTier {
    Basic,
    Pro,
}

/// Per-tier API call allowance written alongside the plan label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPreset {
    pub post_api_calls: i32,
    pub get_api_calls: i32,
    pub edit_api_calls: i32,
}

pub const BASIC_QUOTA: QuotaPreset = QuotaPreset {
    post_api_calls: 5,
    get_api_calls: 5,
    edit_api_calls: 5,
};

pub const PRO_QUOTA: QuotaPreset = QuotaPreset {
    post_api_calls: 10,
    get_api_calls: 10,
    edit_api_calls: 10,
};

impl PlanTier {
    pub const fn quota(self) -> QuotaPreset {
        match self {
            PlanTier::Basic => BASIC_QUOTA,
            PlanTier::Pro => PRO_QUOTA,
        }
    }
}
