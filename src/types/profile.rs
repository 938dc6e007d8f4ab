//! Read-only inputs supplied by the feature provider

use serde::{Deserialize, Serialize};

/// One historical `(user_id, amount)` refund pair, used only for
/// anomaly scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalRefundSample {
    pub user_id: i64,
    pub amount: f64,
}

impl HistoricalRefundSample {
    pub fn new(user_id: i64, amount: f64) -> Self {
        Self { user_id, amount }
    }
}

/// Account profile of the requesting user, embedded in the advisory
/// prompt. A missing profile forces manual review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub account_age_days: i64,
    pub total_orders: i64,
    pub total_refunds: i64,
    pub flagged_for_fraud: bool,
}

/// Order line item embedded in the advisory prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemDetail {
    pub item_id: i64,
    pub name: String,
    pub quantity: i32,
    pub unit_price: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_round_trip() {
        let profile = UserProfile {
            account_age_days: 365,
            total_orders: 20,
            total_refunds: 2,
            flagged_for_fraud: false,
        };

        let json = serde_json::to_string(&profile).unwrap();
        let deserialized: UserProfile = serde_json::from_str(&json).unwrap();

        assert_eq!(profile.account_age_days, deserialized.account_age_days);
        assert_eq!(profile.flagged_for_fraud, deserialized.flagged_for_fraud);
    }
}
