//! # Privilege Eligibility
//!
//! Pure evaluation of the five redemption predicates. Callers supply the
//! state; this module never reads the ledger. The redemption executor calls
//! [`PrivilegeEligibilityEngine::evaluate`] again under row locks, so a report
//! produced for display is advisory only.
//!
//! ## Exact Set Rule
//!
//! The distinct items a user holds (`owned > 0`) in the privilege's campaign
//! must *equal* the required item set. Holding an extra item from the same
//! campaign makes the user ineligible.

use std::collections::BTreeSet;

use crate::error::RejectionReason;
use crate::types::{ItemId, Ownership, Privilege, Timestamp};

/// Everything needed to judge one redemption attempt.
#[derive(Clone, Copy, Debug)]
pub struct EligibilityInput<'a> {
    /// Privilege being redeemed.
    pub privilege: &'a Privilege,
    /// The user's ownership rows, restricted to the privilege's campaign.
    pub holdings: &'a [Ownership],
    /// Current time.
    pub now: Timestamp,
    /// Executions so far across all users.
    pub executed_total: u64,
    /// Whether the user is on the campaign issuer's block list.
    pub blocked: bool,
}

/// Individual predicate results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EligibilityReport {
    /// Held item set equals the required item set.
    pub set_matches: bool,
    /// Every required amount is held.
    pub amounts_sufficient: bool,
    /// `now` is before the privilege's expiry.
    pub not_expired: bool,
    /// Global executions are below the cap.
    pub under_limit: bool,
    /// The user is not blocked by the issuer.
    pub not_blocked: bool,
}

impl EligibilityReport {
    /// Returns true if every predicate holds.
    #[must_use]
    pub const fn is_eligible(&self) -> bool {
        self.set_matches
            && self.amounts_sufficient
            && self.not_expired
            && self.under_limit
            && self.not_blocked
    }

    /// The first failing predicate, in reporting order:
    /// `Expired`, `Blocked`, `IncompleteSet`, `InsufficientAmount`,
    /// `LimitReached`.
    #[must_use]
    pub const fn rejection(&self) -> Option<RejectionReason> {
        if !self.not_expired {
            Some(RejectionReason::Expired)
        } else if !self.not_blocked {
            Some(RejectionReason::Blocked)
        } else if !self.set_matches {
            Some(RejectionReason::IncompleteSet)
        } else if !self.amounts_sufficient {
            Some(RejectionReason::InsufficientAmount)
        } else if !self.under_limit {
            Some(RejectionReason::LimitReached)
        } else {
            None
        }
    }
}

/// Stateless predicate evaluator.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrivilegeEligibilityEngine;

impl PrivilegeEligibilityEngine {
    /// Evaluates every predicate.
    #[must_use]
    pub fn evaluate(input: &EligibilityInput<'_>) -> EligibilityReport {
        let privilege = input.privilege;

        let held: BTreeSet<ItemId> = input
            .holdings
            .iter()
            .filter(|row| row.owned > 0)
            .map(|row| row.item_id)
            .collect();
        let required: BTreeSet<ItemId> = privilege
            .requirements
            .iter()
            .map(|entry| entry.item_id)
            .collect();

        let owned_of = |item_id: ItemId| {
            input
                .holdings
                .iter()
                .filter(|row| row.item_id == item_id)
                .map(|row| row.owned)
                .sum::<u64>()
        };

        EligibilityReport {
            set_matches: held == required,
            amounts_sufficient: privilege
                .requirements
                .iter()
                .all(|entry| owned_of(entry.item_id) >= entry.amount),
            not_expired: input.now < privilege.expires_at,
            under_limit: input.executed_total < privilege.limit_execution_times,
            not_blocked: !input.blocked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequirementEntry;

    const A: ItemId = 1;
    const B: ItemId = 2;
    const C: ItemId = 3;

    fn privilege() -> Privilege {
        Privilege {
            id: 1,
            campaign_id: 1,
            expires_at: 1_000,
            limit_execution_times: 1,
            requirements: vec![RequirementEntry::new(A, 5), RequirementEntry::new(B, 5)],
        }
    }

    fn holding(item_id: ItemId, owned: u64) -> Ownership {
        Ownership {
            owned,
            ..Ownership::empty(7, item_id)
        }
    }

    fn evaluate(privilege: &Privilege, holdings: &[Ownership]) -> EligibilityReport {
        PrivilegeEligibilityEngine::evaluate(&EligibilityInput {
            privilege,
            holdings,
            now: 500,
            executed_total: 0,
            blocked: false,
        })
    }

    #[test]
    fn test_exact_holdings_are_eligible() {
        let report = evaluate(&privilege(), &[holding(A, 10), holding(B, 10)]);
        assert!(report.is_eligible());
        assert_eq!(report.rejection(), None);
    }

    #[test]
    fn test_superset_is_ineligible() {
        let report = evaluate(&privilege(), &[holding(A, 10), holding(B, 10), holding(C, 1)]);
        assert!(!report.set_matches);
        assert!(report.amounts_sufficient);
        assert_eq!(report.rejection(), Some(RejectionReason::IncompleteSet));
    }

    #[test]
    fn test_single_requirement_with_extra_item() {
        let single = Privilege {
            requirements: vec![RequirementEntry::new(A, 1)],
            ..privilege()
        };
        let report = evaluate(&single, &[holding(A, 1), holding(B, 1)]);
        assert_eq!(report.rejection(), Some(RejectionReason::IncompleteSet));
    }

    #[test]
    fn test_subset_is_ineligible() {
        let report = evaluate(&privilege(), &[holding(A, 10)]);
        assert_eq!(report.rejection(), Some(RejectionReason::IncompleteSet));
    }

    #[test]
    fn test_zero_balance_rows_do_not_count() {
        let report = evaluate(&privilege(), &[holding(A, 5), holding(B, 5), holding(C, 0)]);
        assert!(report.is_eligible());
    }

    #[test]
    fn test_insufficient_amount() {
        let report = evaluate(&privilege(), &[holding(A, 5), holding(B, 4)]);
        assert!(report.set_matches);
        assert_eq!(report.rejection(), Some(RejectionReason::InsufficientAmount));
    }

    #[test]
    fn test_expiry_is_exclusive() {
        let privilege = privilege();
        let holdings = [holding(A, 5), holding(B, 5)];
        let at = |now| {
            PrivilegeEligibilityEngine::evaluate(&EligibilityInput {
                privilege: &privilege,
                holdings: &holdings,
                now,
                executed_total: 0,
                blocked: false,
            })
        };
        assert!(at(999).is_eligible());
        assert_eq!(at(1_000).rejection(), Some(RejectionReason::Expired));
    }

    #[test]
    fn test_limit_and_block_predicates() {
        let privilege = privilege();
        let holdings = [holding(A, 5), holding(B, 5)];
        let report = PrivilegeEligibilityEngine::evaluate(&EligibilityInput {
            privilege: &privilege,
            holdings: &holdings,
            now: 0,
            executed_total: 1,
            blocked: true,
        });
        assert!(!report.under_limit);
        assert!(!report.not_blocked);
        assert_eq!(report.rejection(), Some(RejectionReason::Blocked));
    }
}
