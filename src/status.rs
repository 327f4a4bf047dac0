/// Campaign status lattice
///
/// Allowed transitions: ACTIVE -> SUCCESS -> WITHDRAWN and ACTIVE -> FAILED.
/// The stored status is a materialization of (total_raised, goal, deadline,
/// withdrawn); this module is the single place that derivation lives so the
/// state updater, the rollback rebuild and the reconciler cannot drift.

use bigdecimal::BigDecimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignStatus {
    Active,
    Success,
    Failed,
    Withdrawn,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Withdrawn => "WITHDRAWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "WITHDRAWN" => Some(Self::Withdrawn),
            _ => None,
        }
    }

    /// True when `next` is reachable from `self` in zero or more lattice
    /// steps. Used to refuse downgrades on out-of-order delivery.
    pub fn allows(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Active, Success) | (Active, Failed) | (Active, Withdrawn) => true,
            (Success, Withdrawn) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Withdrawn)
    }
}

/// Derive the materialized status from first principles. Withdrawal
/// dominates; a met goal is SUCCESS regardless of deadline (the contract
/// permits early withdrawal once the goal is met); an expired, under-goal
/// campaign is FAILED.
pub fn derive_status(
    total_raised: &BigDecimal,
    goal: &BigDecimal,
    deadline: i64,
    withdrawn: bool,
    now: i64,
) -> CampaignStatus {
    if withdrawn {
        CampaignStatus::Withdrawn
    } else if total_raised >= goal {
        CampaignStatus::Success
    } else if deadline < now {
        CampaignStatus::Failed
    } else {
        CampaignStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_lattice_transitions() {
        use CampaignStatus::*;
        assert!(Active.allows(Success));
        assert!(Active.allows(Failed));
        assert!(Active.allows(Withdrawn));
        assert!(Success.allows(Withdrawn));

        assert!(!Success.allows(Active));
        assert!(!Success.allows(Failed));
        assert!(!Failed.allows(Success));
        assert!(!Failed.allows(Withdrawn));
        assert!(!Withdrawn.allows(Success));
        assert!(!Withdrawn.allows(Active));
    }

    #[test]
    fn test_lattice_reflexive() {
        use CampaignStatus::*;
        for status in [Active, Success, Failed, Withdrawn] {
            assert!(status.allows(status));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!CampaignStatus::Active.is_terminal());
        assert!(!CampaignStatus::Success.is_terminal());
        assert!(CampaignStatus::Failed.is_terminal());
        assert!(CampaignStatus::Withdrawn.is_terminal());
    }

    #[test]
    fn test_derive_withdrawn_dominates() {
        // even with deadline passed and goal unmet
        let status = derive_status(&dec("1"), &dec("10"), 100, true, 200);
        assert_eq!(status, CampaignStatus::Withdrawn);
    }

    #[test]
    fn test_derive_success_on_goal_met() {
        assert_eq!(
            derive_status(&dec("10"), &dec("10"), 1000, false, 500),
            CampaignStatus::Success
        );
        // goal met after deadline still reads SUCCESS until withdrawn
        assert_eq!(
            derive_status(&dec("11"), &dec("10"), 100, false, 500),
            CampaignStatus::Success
        );
    }

    #[test]
    fn test_derive_failed_after_deadline_under_goal() {
        assert_eq!(
            derive_status(&dec("9"), &dec("10"), 100, false, 500),
            CampaignStatus::Failed
        );
    }

    #[test]
    fn test_derive_active_before_deadline_under_goal() {
        assert_eq!(
            derive_status(&dec("9"), &dec("10"), 1000, false, 500),
            CampaignStatus::Active
        );
        // deadline exactly now is not yet expired
        assert_eq!(
            derive_status(&dec("9"), &dec("10"), 500, false, 500),
            CampaignStatus::Active
        );
    }

    #[test]
    fn test_round_trip_strings() {
        use CampaignStatus::*;
        for status in [Active, Success, Failed, Withdrawn] {
            assert_eq!(CampaignStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CampaignStatus::parse("UNKNOWN"), None);
    }
}
