//! # Privilege Redemption
//!
//! One locked transaction per attempt:
//!
//! ```text
//! Requested ──> lock usage row + user's campaign ownership rows
//!                 │
//!                 ├─ predicate fails ──────────────────> Rejected(reason)
//!                 ▼
//!             Validated ──> debit requirement set ──> Debited
//!                                                       │
//!               bump execution + usage counters <───────┘
//!                 │
//!                 ▼
//!             Recorded ──> commit ──> Completed ──> RedemptionCompleted event
//! ```
//!
//! Eligibility is evaluated on the locked rows, never on an earlier read, so
//! two concurrent attempts cannot both pass and double-debit. Lock order is
//! usage row first, then ownership rows by ascending item id.

use std::fmt;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::eligibility::{EligibilityInput, EligibilityReport, PrivilegeEligibilityEngine};
use crate::error::{EngineError, EngineResult, RejectionReason};
use crate::events::{EngineEvent, EventBus};
use crate::ledger::debit_in;
use crate::store::LedgerStore;
use crate::types::{Clock, ItemId, Ownership, Privilege, PrivilegeId, UserId};

/// A request to redeem a privilege. The caller identity is already verified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedemptionRequest {
    /// Redeeming user.
    pub user_id: UserId,
    /// Privilege to redeem.
    pub privilege_id: PrivilegeId,
}

/// Redemption state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedemptionState {
    /// Attempt received.
    Requested,
    /// Every predicate held on the locked rows.
    Validated,
    /// Requirement set consumed.
    Debited,
    /// Execution counters bumped.
    Recorded,
    /// Committed.
    Completed,
    /// Refused; nothing written.
    Rejected(RejectionReason),
}

impl fmt::Display for RedemptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("requested"),
            Self::Validated => f.write_str("validated"),
            Self::Debited => f.write_str("debited"),
            Self::Recorded => f.write_str("recorded"),
            Self::Completed => f.write_str("completed"),
            Self::Rejected(reason) => write!(f, "rejected({reason})"),
        }
    }
}

/// Terminal outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedemptionOutcome {
    /// Redeemed.
    Completed {
        /// The user's execution count after this redemption.
        execution_times: u64,
    },
    /// Refused with a reason.
    Rejected(RejectionReason),
}

/// Typed result of one attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedemptionResult {
    /// Redeeming user.
    pub user_id: UserId,
    /// Privilege.
    pub privilege_id: PrivilegeId,
    /// Terminal outcome.
    pub outcome: RedemptionOutcome,
    /// Every state visited, in order.
    pub trail: Vec<RedemptionState>,
}

impl RedemptionResult {
    fn rejected(request: &RedemptionRequest, trail: &[RedemptionState], reason: RejectionReason) -> Self {
        let mut trail = trail.to_vec();
        trail.push(RedemptionState::Rejected(reason));
        Self {
            user_id: request.user_id,
            privilege_id: request.privilege_id,
            outcome: RedemptionOutcome::Rejected(reason),
            trail,
        }
    }

    /// Returns true if the redemption committed.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.outcome, RedemptionOutcome::Completed { .. })
    }

    /// The rejection reason, if refused.
    #[must_use]
    pub const fn rejection(&self) -> Option<RejectionReason> {
        match self.outcome {
            RedemptionOutcome::Rejected(reason) => Some(reason),
            RedemptionOutcome::Completed { .. } => None,
        }
    }

    /// The last state visited.
    #[must_use]
    pub fn state(&self) -> RedemptionState {
        self.trail
            .last()
            .copied()
            .unwrap_or(RedemptionState::Requested)
    }
}

/// Executes privilege redemptions.
pub struct RedemptionExecutor<S, C> {
    store: Arc<S>,
    catalog: Arc<C>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl<S: LedgerStore, C: Catalog> RedemptionExecutor<S, C> {
    /// Creates an executor.
    #[must_use]
    pub fn new(store: Arc<S>, catalog: Arc<C>, events: Arc<EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            catalog,
            events,
            clock,
        }
    }

    /// Resolves the privilege, its campaign item ids and the block flag.
    fn resolve(&self, request: &RedemptionRequest) -> Option<(Privilege, Vec<ItemId>, bool)> {
        let privilege = self.catalog.privilege(request.privilege_id)?;
        let campaign = self.catalog.campaign(privilege.campaign_id)?;
        let mut item_ids: Vec<ItemId> = self
            .catalog
            .items_in_campaign(campaign.id)
            .into_iter()
            .map(|item| item.id)
            .collect();
        item_ids.sort_unstable();
        item_ids.dedup();
        let blocked = self.catalog.is_blocked(campaign.issuer_id, request.user_id);
        Some((privilege, item_ids, blocked))
    }

    /// Attempts one redemption.
    ///
    /// Business refusals come back as `Ok` with a `Rejected` outcome.
    ///
    /// # Errors
    ///
    /// `LockTimeout` or another transient store error; nothing is written and
    /// the attempt can be retried.
    pub fn redeem(&self, request: &RedemptionRequest) -> EngineResult<RedemptionResult> {
        let mut trail = vec![RedemptionState::Requested];

        let Some((privilege, item_ids, blocked)) = self.resolve(request) else {
            tracing::warn!(
                "redemption by user {} refused: privilege {} not found",
                request.user_id,
                request.privilege_id
            );
            return Ok(RedemptionResult::rejected(request, &trail, RejectionReason::NotFound));
        };
        let now = self.clock.now_ms();
        let user_id = request.user_id;

        let result = self.store.transaction(|tx| {
            let mut usage = tx.lock_privilege_usage(privilege.id)?;
            let holdings = item_ids
                .iter()
                .map(|&item_id| tx.lock_ownership(user_id, item_id))
                .collect::<EngineResult<Vec<Ownership>>>()?;

            let report = PrivilegeEligibilityEngine::evaluate(&EligibilityInput {
                privilege: &privilege,
                holdings: &holdings,
                now,
                executed_total: usage.executed_total,
                blocked,
            });
            if let Some(reason) = report.rejection() {
                return Ok(Err(reason));
            }

            debit_in(tx, user_id, &privilege.requirements)?;

            let mut execution = tx.lock_execution(user_id, privilege.id)?;
            execution.execution_times = execution
                .execution_times
                .checked_add(1)
                .ok_or(EngineError::ArithmeticOverflow)?;
            tx.put_execution(execution)?;

            usage.executed_total = usage
                .executed_total
                .checked_add(1)
                .ok_or(EngineError::ArithmeticOverflow)?;
            tx.put_privilege_usage(usage)?;

            Ok(Ok(execution.execution_times))
        });

        let execution_times = match result {
            Ok(Ok(execution_times)) => execution_times,
            Ok(Err(reason)) => {
                tracing::warn!(
                    "redemption of privilege {} by user {} rejected: {}",
                    privilege.id,
                    user_id,
                    reason
                );
                return Ok(RedemptionResult::rejected(request, &trail, reason));
            }
            Err(EngineError::InsufficientInventory {
                item_id,
                required,
                available,
            }) => {
                tracing::warn!(
                    "redemption of privilege {} by user {} rejected: item {} short ({} of {})",
                    privilege.id,
                    user_id,
                    item_id,
                    available,
                    required
                );
                trail.push(RedemptionState::Validated);
                return Ok(RedemptionResult::rejected(
                    request,
                    &trail,
                    RejectionReason::InsufficientAmount,
                ));
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::warn!("redemption of privilege {} aborted: {}", privilege.id, e);
                }
                return Err(e);
            }
        };

        trail.extend([
            RedemptionState::Validated,
            RedemptionState::Debited,
            RedemptionState::Recorded,
            RedemptionState::Completed,
        ]);
        tracing::info!(
            "privilege {} redeemed by user {} (execution {})",
            privilege.id,
            user_id,
            execution_times
        );
        self.events.publish(EngineEvent::RedemptionCompleted {
            user_id,
            privilege_id: privilege.id,
            execution_times,
        });

        Ok(RedemptionResult {
            user_id,
            privilege_id: privilege.id,
            outcome: RedemptionOutcome::Completed { execution_times },
            trail,
        })
    }

    /// Evaluates eligibility on committed state without locking.
    ///
    /// Returns `None` if the privilege or its campaign does not exist. The
    /// report is advisory; [`Self::redeem`] re-checks under locks.
    ///
    /// # Errors
    ///
    /// Store read errors.
    pub fn preview(
        &self,
        user_id: UserId,
        privilege_id: PrivilegeId,
    ) -> EngineResult<Option<EligibilityReport>> {
        let request = RedemptionRequest {
            user_id,
            privilege_id,
        };
        let Some((privilege, item_ids, blocked)) = self.resolve(&request) else {
            return Ok(None);
        };

        let holdings: Vec<Ownership> = self
            .store
            .ownerships_of(user_id)?
            .into_iter()
            .filter(|row| item_ids.binary_search(&row.item_id).is_ok())
            .collect();
        let usage = self.store.privilege_usage(privilege_id)?;

        Ok(Some(PrivilegeEligibilityEngine::evaluate(&EligibilityInput {
            privilege: &privilege,
            holdings: &holdings,
            now: self.clock.now_ms(),
            executed_total: usage.executed_total,
            blocked,
        })))
    }
}

impl<S, C> fmt::Debug for RedemptionExecutor<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedemptionExecutor").finish_non_exhaustive()
    }
}
