//! # Condition Aggregator
//!
//! Per-invocation value type collecting the sub-conditions a reconciliation
//! evaluates and folding them into the single `Ready` condition.
//!
//! Ready is:
//! - `True` when every tracked sub-condition is `True`
//! - `False` when any sub-condition is `False`, mirroring the most severe
//!   one (`Error` before `Warning` before `Info`, ties go to the earlier
//!   tracked type)
//! - `Unknown` otherwise
//!
//! `lastTransitionTime` only moves when a condition's status changes, so
//! re-running a pass with no state change yields the same condition set.

use crate::crd::{Condition, ConditionReason, ConditionStatus, ConditionType, Severity};
use chrono::{SecondsFormat, Utc};

#[derive(Debug, Clone)]
pub struct ConditionSet {
    tracked: Vec<Condition>,
    ready: Condition,
    generation: Option<i64>,
    fresh: bool,
}

impl ConditionSet {
    /// Build the set for `tracked` types, carrying over what `existing` already reports
    ///
    /// Types not present in `existing` are seeded `Unknown`/`Init`. Types in
    /// `existing` that are no longer tracked are dropped.
    #[must_use]
    pub fn init(tracked: &[ConditionType], existing: &[Condition], generation: Option<i64>) -> Self {
        let find = |type_: ConditionType| existing.iter().find(|c| c.type_ == type_).cloned();
        let fresh = find(ConditionType::Ready).is_none();
        let tracked = tracked
            .iter()
            .filter(|t| **t != ConditionType::Ready)
            .map(|t| find(*t).unwrap_or_else(|| seed(*t, generation)))
            .collect();
        let ready = find(ConditionType::Ready).unwrap_or_else(|| seed(ConditionType::Ready, generation));
        Self {
            tracked,
            ready,
            generation,
            fresh,
        }
    }

    /// True when the object carried no conditions before this invocation
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Record one sub-condition
    ///
    /// Untracked types are ignored so optional stages can report unconditionally.
    pub fn set_sub_condition(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        reason: ConditionReason,
        severity: Option<Severity>,
        message: impl Into<String>,
    ) {
        let generation = self.generation;
        if let Some(condition) = self.tracked.iter_mut().find(|c| c.type_ == type_) {
            apply(condition, status, reason, severity, message.into(), generation);
        }
    }

    pub fn mark_true(&mut self, type_: ConditionType, message: impl Into<String>) {
        self.set_sub_condition(
            type_,
            ConditionStatus::True,
            ConditionReason::Ready,
            None,
            message,
        );
    }

    pub fn mark_false(
        &mut self,
        type_: ConditionType,
        reason: ConditionReason,
        severity: Severity,
        message: impl Into<String>,
    ) {
        self.set_sub_condition(
            type_,
            ConditionStatus::False,
            reason,
            Some(severity),
            message,
        );
    }

    pub fn mark_unknown(
        &mut self,
        type_: ConditionType,
        reason: ConditionReason,
        message: impl Into<String>,
    ) {
        self.set_sub_condition(type_, ConditionStatus::Unknown, reason, None, message);
    }

    #[must_use]
    pub fn get(&self, type_: ConditionType) -> Option<&Condition> {
        if type_ == ConditionType::Ready {
            return Some(&self.ready);
        }
        self.tracked.iter().find(|c| c.type_ == type_)
    }

    #[must_use]
    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.get(type_).is_some_and(Condition::is_true)
    }

    /// Fold the sub-conditions into Ready
    pub fn recompute_ready(&mut self) {
        let generation = self.generation;
        if self.tracked.iter().all(Condition::is_true) {
            apply(
                &mut self.ready,
                ConditionStatus::True,
                ConditionReason::Ready,
                None,
                "Setup complete".to_string(),
                generation,
            );
            return;
        }

        let worst = self
            .tracked
            .iter()
            .enumerate()
            .filter(|(_, c)| c.status == ConditionStatus::False)
            .min_by_key(|(index, c)| (c.severity.unwrap_or(Severity::Info), *index))
            .map(|(_, c)| c.clone());

        match worst {
            Some(failing) => apply(
                &mut self.ready,
                ConditionStatus::False,
                failing.reason,
                failing.severity,
                failing.message,
                generation,
            ),
            None => {
                let pending = self
                    .tracked
                    .iter()
                    .find(|c| c.status == ConditionStatus::Unknown)
                    .map(|c| c.message.clone())
                    .unwrap_or_default();
                apply(
                    &mut self.ready,
                    ConditionStatus::Unknown,
                    ConditionReason::Init,
                    None,
                    pending,
                    generation,
                );
            }
        }
    }

    /// Conditions as persisted: Ready first, then the tracked order
    #[must_use]
    pub fn to_vec(&self) -> Vec<Condition> {
        std::iter::once(self.ready.clone())
            .chain(self.tracked.iter().cloned())
            .collect()
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn seed(type_: ConditionType, generation: Option<i64>) -> Condition {
    Condition {
        type_,
        status: ConditionStatus::Unknown,
        severity: None,
        reason: ConditionReason::Init,
        message: format!("{} not started", type_),
        last_transition_time: now(),
        observed_generation: generation,
    }
}

fn apply(
    condition: &mut Condition,
    status: ConditionStatus,
    reason: ConditionReason,
    severity: Option<Severity>,
    message: String,
    generation: Option<i64>,
) {
    if condition.status != status {
        condition.last_transition_time = now();
    }
    condition.status = status;
    condition.reason = reason;
    condition.severity = if status == ConditionStatus::False {
        severity
    } else {
        None
    };
    condition.message = message;
    condition.observed_generation = generation;
}
