//! Condition model: the single policy point deciding whether a resource
//! finished reconciling.
//!
//! A condition is only trustworthy once `status.observedGeneration` caught up
//! with `metadata.generation`; before that the object is mid-reconciliation
//! and whatever it reports belongs to an older spec.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{ConditionType, KfObject, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Condition record as stored on the object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(type_: impl fmt::Display, status: ConditionStatus) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

/// Canonical `{type, status, reason, message}` view of a condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionSummary {
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

/// A condition observed `False` (or carrying an unexpected status).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationFailure {
    /// Set when a specific condition type was being checked.
    pub condition: Option<String>,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

impl fmt::Display for ReconciliationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.condition {
            Some(c) => write!(f, "checking {} failed, status: {} message: {} reason: {}", c, self.status, self.message, self.reason),
            None => write!(f, "Reason: {:?}, Message: {:?}", self.reason, self.message),
        }
    }
}

impl std::error::Error for ReconciliationFailure {}

/// Terminal outcome of a condition check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckError {
    #[error(transparent)]
    Fetch(StoreError),
    #[error(transparent)]
    Failed(ReconciliationFailure),
}

/// `Ok(true)` once done, `Ok(false)` to keep polling, `Err` when done with a failure.
pub type CheckResult = Result<bool, CheckError>;

pub fn observed_generation_matches_generation<K: KfObject>(obj: &K) -> bool {
    obj.generation() == obj.observed_generation()
}

/// Map stored conditions to their canonical form, dropping transition times.
pub fn extract_conditions<K: KfObject>(obj: &K) -> SmallVec<[ConditionSummary; 4]> {
    obj.conditions()
        .iter()
        .map(|c| ConditionSummary {
            type_: c.type_.clone(),
            status: c.status,
            reason: c.reason.clone(),
            message: c.message.clone(),
        })
        .collect()
}

pub fn find_condition<'a, K: KfObject>(obj: &'a K, condition: K::Condition) -> Option<&'a Condition> {
    obj.conditions().iter().find(|c| c.type_ == condition.as_str())
}

/// Decide whether `condition` reached `True` on a freshly fetched object.
///
/// An absent condition keeps the wait going; only the caller's deadline
/// bounds it.
pub fn check_condition_true<K: KfObject>(fetched: Result<&K, &StoreError>, condition: K::Condition) -> CheckResult {
    let obj = fetched.map_err(|e| CheckError::Fetch(e.clone()))?;

    // don't propagate old statuses
    if !observed_generation_matches_generation(obj) {
        return Ok(false);
    }

    for cond in extract_conditions(obj) {
        if cond.type_ != condition.as_str() {
            continue;
        }
        return match cond.status {
            ConditionStatus::True => Ok(true),
            ConditionStatus::Unknown => Ok(false),
            ConditionStatus::False => Err(CheckError::Failed(ReconciliationFailure {
                condition: Some(cond.type_),
                status: cond.status,
                reason: cond.reason,
                message: cond.message,
            })),
        };
    }

    Ok(false)
}

/// Done once the store reports the object gone.
pub fn condition_deleted<K: KfObject>(fetched: Result<&K, &StoreError>) -> CheckResult {
    match fetched {
        Ok(_) => Ok(false),
        Err(e) if e.is_not_found() => Ok(true),
        Err(e) => Err(CheckError::Fetch(e.clone())),
    }
}

/// Turn a plain predicate into a condition check. Stale objects are never
/// done; fetch errors and any `False` condition of an up-to-date object fail.
pub fn wrap_predicate<K, P>(predicate: P) -> impl FnMut(Result<&K, &StoreError>) -> CheckResult
where
    K: KfObject,
    P: Fn(&K) -> bool,
{
    move |fetched| {
        let obj = fetched.map_err(|e| CheckError::Fetch(e.clone()))?;
        if !observed_generation_matches_generation(obj) {
            return Ok(false);
        }
        if let Some(cond) = obj.conditions().iter().find(|c| c.status == ConditionStatus::False) {
            return Err(CheckError::Failed(ReconciliationFailure {
                condition: None,
                status: cond.status,
                reason: cond.reason.clone(),
                message: cond.message.clone(),
            }));
        }
        Ok(predicate(obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::{Route, RouteConditionType, RouteSpec, RouteStatus};

    fn route(generation: i64, observed: i64, conditions: Vec<Condition>) -> Route {
        let mut r = Route::new("r", RouteSpec::default());
        r.metadata.generation = Some(generation);
        r.status = Some(RouteStatus { observed_generation: Some(observed), conditions });
        r
    }

    #[test]
    fn ready_true_is_done() {
        let r = route(2, 2, vec![Condition::new("Ready", ConditionStatus::True)]);
        assert_eq!(check_condition_true(Ok(&r), RouteConditionType::Ready), Ok(true));
    }

    #[test]
    fn unknown_keeps_polling() {
        let r = route(2, 2, vec![Condition::new("Ready", ConditionStatus::Unknown)]);
        assert_eq!(check_condition_true(Ok(&r), RouteConditionType::Ready), Ok(false));
    }

    #[test]
    fn stale_generation_ignores_conditions() {
        let r = route(5, 4, vec![Condition::new("Ready", ConditionStatus::False).with_message("stale")]);
        assert_eq!(check_condition_true(Ok(&r), RouteConditionType::Ready), Ok(false));
        let mut check = wrap_predicate(|_: &Route| true);
        assert_eq!(check(Ok(&r)), Ok(false));
    }

    #[test]
    fn false_fails_with_details() {
        let r = route(1, 1, vec![Condition::new("Ready", ConditionStatus::False).with_reason("NoDomain").with_message("domain missing")]);
        let err = check_condition_true(Ok(&r), RouteConditionType::Ready).unwrap_err();
        assert_eq!(err.to_string(), "checking Ready failed, status: False message: domain missing reason: NoDomain");
    }

    #[test]
    fn absent_condition_is_not_done() {
        // An object that never reports the condition waits until the caller gives up.
        let r = route(3, 3, vec![Condition::new("Other", ConditionStatus::True)]);
        assert_eq!(check_condition_true(Ok(&r), RouteConditionType::Ready), Ok(false));
    }

    #[test]
    fn fetch_error_is_terminal() {
        let e = StoreError::Other("boom".into());
        assert_eq!(check_condition_true::<Route>(Err(&e), RouteConditionType::Ready), Err(CheckError::Fetch(e)));
    }

    #[test]
    fn deleted_on_not_found_only() {
        let nf = StoreError::NotFound("r".into());
        assert_eq!(condition_deleted::<Route>(Err(&nf)), Ok(true));
        let other = StoreError::Other("timeout".into());
        assert!(condition_deleted::<Route>(Err(&other)).is_err());
        let r = route(1, 1, vec![]);
        assert_eq!(condition_deleted(Ok(&r)), Ok(false));
    }

    #[test]
    fn wrapped_predicate_fails_on_any_false() {
        let r = route(1, 1, vec![
            Condition::new("Ready", ConditionStatus::Unknown),
            Condition::new("Other", ConditionStatus::False).with_reason("R").with_message("M"),
        ]);
        let mut check = wrap_predicate(|_: &Route| true);
        assert_eq!(check(Ok(&r)).unwrap_err().to_string(), "Reason: \"R\", Message: \"M\"");
    }

    #[test]
    fn extract_drops_transition_time() {
        let r = route(1, 1, vec![Condition::new("Ready", ConditionStatus::True).with_message("ok")]);
        let got = extract_conditions(&r);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], ConditionSummary { type_: "Ready".into(), status: ConditionStatus::True, reason: String::new(), message: "ok".into() });
    }
}
