//! kfx core types: resource kinds, the condition model and store errors.

#![forbid(unsafe_code)]

use std::fmt;

use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};

pub mod conditions;
pub mod kinds;

pub use conditions::{Condition, ConditionStatus, ConditionSummary, ReconciliationFailure};
pub use kinds::{App, AppConditionType, AppSpec, AppStatus, Route, RouteConditionType, RouteSpec, RouteStatus, Task, TaskConditionType, TaskSpec, TaskStatus};

pub mod prelude {
    pub use super::{Condition, ConditionStatus, ConditionType, KfObject, StoreError};
    pub use super::kinds::{App, Route, Task};
}

/// Error classes a backing store must keep distinguishable.
///
/// `Conflict` and `NotFound` drive the retry and wait logic of the client;
/// everything else (transport, auth, validation) is carried as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
}

/// Per-kind enumeration of condition types reported by the reconciler.
pub trait ConditionType: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// The aggregate readiness condition every kind reports.
    const READY: Self;
    const ALL: &'static [Self];

    fn as_str(&self) -> &'static str;

    /// Case-insensitive lookup by wire name.
    fn parse(name: &str) -> Option<Self> { Self::ALL.iter().copied().find(|c| c.as_str().eq_ignore_ascii_case(name)) }
}

/// Adapter implemented by every kind the generic client can manage.
pub trait KfObject: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    type Condition: ConditionType;

    /// User-facing singular name, e.g. `Route`.
    const FRIENDLY_NAME: &'static str;
    /// User-facing plural name, e.g. `Routes`.
    const FRIENDLY_PLURAL: &'static str;

    fn observed_generation(&self) -> i64;
    fn conditions(&self) -> &[Condition];

    /// Mutable access to reported conditions (reconcilers and test fixtures).
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn set_observed_generation(&mut self, generation: i64);

    fn generation(&self) -> i64 { self.meta().generation.unwrap_or(0) }
}
