//! Reconciler — applies decisions to a target's state.
//!
//! Each target moves `Stable → Cooling → Stable`. Cooling starts when an
//! action is applied and ends once `cooldown` has elapsed; expiry is
//! purely time-based and re-checked on every call.

use std::time::Duration;

use tracing::debug;

use gridscale_core::{
    AppliedAction, Capacity, ReasonCode, ScalableTarget, ScalingDecision, Timestamp,
};

/// Why a decision was not applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejected {
    /// The decision proposed nothing.
    NoOp { reason: ReasonCode },
    /// The target is still cooling down from its previous action.
    CooldownActive { remaining: Duration },
    /// After clamping, the proposal equals the current capacity.
    Unchanged { capacity: Capacity },
    /// The proposal's capacity kind does not match the target.
    KindMismatch,
}

impl Rejected {
    pub fn reason(&self) -> ReasonCode {
        match self {
            Rejected::NoOp { reason } => *reason,
            Rejected::CooldownActive { .. } => ReasonCode::CooldownActive,
            Rejected::Unchanged { .. } => ReasonCode::Unchanged,
            Rejected::KindMismatch => ReasonCode::KindMismatch,
        }
    }
}

/// Apply `decision` to `target` if cooldown and bounds allow it.
///
/// On success the target's capacity is set to the clamped proposal and
/// the cooldown clock restarts at `now`. Rejections leave the target
/// untouched.
pub fn reconcile(
    target: &mut ScalableTarget,
    decision: &ScalingDecision,
    cooldown: Duration,
    now: Timestamp,
) -> Result<AppliedAction, Rejected> {
    let Some(proposed) = decision.proposed else {
        return Err(Rejected::NoOp {
            reason: decision.reason,
        });
    };

    if let Some(remaining) = target.cooldown_remaining(cooldown, now) {
        debug!(
            target_id = %target.id,
            remaining_ms = remaining.as_millis() as u64,
            "cooldown active"
        );
        return Err(Rejected::CooldownActive { remaining });
    }

    let clamped = target.bounds.clamp(&proposed).ok_or(Rejected::KindMismatch)?;
    if clamped.capacity == target.capacity {
        return Err(Rejected::Unchanged {
            capacity: target.capacity,
        });
    }

    let action = AppliedAction {
        target_id: target.id.clone(),
        old: target.capacity,
        new: clamped.capacity,
        reason: clamped.reason.unwrap_or(decision.reason),
        timestamp: now,
    };
    target.capacity = clamped.capacity;
    target.last_scale_at = Some(now);

    debug!(
        target_id = %target.id,
        from = %action.old,
        to = %action.new,
        reason = %action.reason,
        "decision reconciled"
    );
    Ok(action)
}

/// Undo the capacity change of an action the effector could not apply.
///
/// The cooldown stamp is kept so a retry waits for the cooldown instead
/// of duplicating an action that may have partially landed.
pub fn revert(target: &mut ScalableTarget, action: &AppliedAction) {
    if target.capacity == action.new {
        target.capacity = action.old;
    }
}
