//! `kf.dev/v1alpha1` kinds managed by the client.

use std::fmt;

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Condition, ConditionType, KfObject};

/// Hex characters of the address digest appended to Route names.
const ROUTE_NAME_DIGEST_LEN: usize = 10;

// ---- App ----

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(group = "kf.dev", version = "v1alpha1", kind = "App", namespaced, status = "AppStatus", schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    #[serde(default)]
    pub instances: AppSpecInstances,
    /// Routes the App asks to be reachable on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteSpecFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<AppSpecBuild>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpecInstances {
    #[serde(default)]
    pub stopped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpecBuild {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Bumped to request a rebuild of unchanged source.
    #[serde(default)]
    pub update_requests: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Build whose logs describe the current rollout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_created_source_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppConditionType {
    Ready,
    SourceReady,
    RoutesReady,
    ServiceBindingsReady,
    DeploymentReady,
}

impl ConditionType for AppConditionType {
    const READY: Self = AppConditionType::Ready;
    const ALL: &'static [Self] = &[
        AppConditionType::Ready,
        AppConditionType::SourceReady,
        AppConditionType::RoutesReady,
        AppConditionType::ServiceBindingsReady,
        AppConditionType::DeploymentReady,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            AppConditionType::Ready => "Ready",
            AppConditionType::SourceReady => "SourceReady",
            AppConditionType::RoutesReady => "RoutesReady",
            AppConditionType::ServiceBindingsReady => "ServiceBindingsReady",
            AppConditionType::DeploymentReady => "DeploymentReady",
        }
    }
}

// ---- Route ----

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(group = "kf.dev", version = "v1alpha1", kind = "Route", namespaced, status = "RouteStatus", schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    #[serde(flatten)]
    pub fields: RouteSpecFields,
    /// Apps bound to this Route. Treated as a set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_names: Vec<String>,
}

/// Address portion of a Route: `hostname.domain/path`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpecFields {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    pub domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

impl RouteSpecFields {
    pub fn new(hostname: impl Into<String>, domain: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.is_empty() || path.starts_with('/') { path } else { format!("/{}", path) };
        Self { hostname: hostname.into(), domain: domain.into(), path }
    }

    /// DNS-safe object name: a readable prefix derived from the address plus
    /// a digest of the exact address, so distinct addresses never share a name.
    pub fn object_name(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.hostname.to_ascii_lowercase());
        hasher.update([0u8]);
        hasher.update(self.domain.to_ascii_lowercase());
        hasher.update([0u8]);
        hasher.update(&self.path);
        let digest = hex::encode(hasher.finalize());
        let digest = &digest[..ROUTE_NAME_DIGEST_LEN];

        let mut parts: Vec<&str> = Vec::new();
        if !self.hostname.is_empty() { parts.push(&self.hostname); }
        parts.push(&self.domain);
        let raw = parts.join("-");
        let mut prefix: String = raw
            .chars()
            .chain(self.path.chars())
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect();
        while prefix.contains("--") { prefix = prefix.replace("--", "-"); }
        // room for "-<digest>" within the 63 character DNS label limit
        prefix.truncate(63 - 1 - ROUTE_NAME_DIGEST_LEN);
        let prefix = prefix.trim_matches('-');
        if prefix.is_empty() {
            digest.to_string()
        } else {
            format!("{}-{}", prefix, digest)
        }
    }
}

impl fmt::Display for RouteSpecFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.hostname.is_empty() { write!(f, "{}.", self.hostname)?; }
        write!(f, "{}{}", self.domain, self.path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteConditionType {
    Ready,
}

impl ConditionType for RouteConditionType {
    const READY: Self = RouteConditionType::Ready;
    const ALL: &'static [Self] = &[RouteConditionType::Ready];

    fn as_str(&self) -> &'static str { "Ready" }
}

// ---- Task ----

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(group = "kf.dev", version = "v1alpha1", kind = "Task", namespaced, status = "TaskStatus", schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// Name of the App whose image the Task runs.
    pub app_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub terminated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskConditionType {
    Ready,
    Succeeded,
}

impl ConditionType for TaskConditionType {
    const READY: Self = TaskConditionType::Ready;
    const ALL: &'static [Self] = &[TaskConditionType::Ready, TaskConditionType::Succeeded];

    fn as_str(&self) -> &'static str {
        match self {
            TaskConditionType::Ready => "Ready",
            TaskConditionType::Succeeded => "Succeeded",
        }
    }
}

// ---- shared plumbing ----

macro_rules! condition_display {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
        }
    )*};
}

condition_display!(AppConditionType, RouteConditionType, TaskConditionType);

macro_rules! kf_object {
    ($kind:ty, $cond:ty, $singular:literal, $plural:literal) => {
        impl KfObject for $kind {
            type Condition = $cond;

            const FRIENDLY_NAME: &'static str = $singular;
            const FRIENDLY_PLURAL: &'static str = $plural;

            fn observed_generation(&self) -> i64 {
                self.status.as_ref().and_then(|s| s.observed_generation).unwrap_or(0)
            }

            fn conditions(&self) -> &[Condition] {
                self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
            }

            fn conditions_mut(&mut self) -> &mut Vec<Condition> {
                &mut self.status.get_or_insert_with(Default::default).conditions
            }

            fn set_observed_generation(&mut self, generation: i64) {
                self.status.get_or_insert_with(Default::default).observed_generation = Some(generation);
            }
        }
    };
}

kf_object!(App, AppConditionType, "App", "Apps");
kf_object!(Route, RouteConditionType, "Route", "Routes");
kf_object!(Task, TaskConditionType, "Task", "Tasks");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_fields_normalise_path_and_name() {
        let f = RouteSpecFields::new("Some-Host", "example.com", "api/v1");
        assert_eq!(f.path, "/api/v1");
        assert_eq!(f.to_string(), "Some-Host.example.com/api/v1");
        assert_eq!(f.object_name(), "some-host-example-com-api-v1-adeba8cd74");
        assert_eq!(RouteSpecFields::new("SOME-host", "Example.com", "/api/v1").object_name(), f.object_name());
    }

    #[test]
    fn route_names_keep_distinct_addresses_apart() {
        let dashed = RouteSpecFields::new("www", "example.com", "/a-b");
        let nested = RouteSpecFields::new("www", "example.com", "/a/b");
        assert_eq!(dashed.object_name(), "www-example-com-a-b-25a2dcd217");
        assert_eq!(nested.object_name(), "www-example-com-a-b-0140e197d2");
        assert_ne!(
            RouteSpecFields::new("a-b", "c.com", "").object_name(),
            RouteSpecFields::new("a", "b-c.com", "").object_name()
        );
    }

    #[test]
    fn long_route_names_fit_a_dns_label() {
        let f = RouteSpecFields::new("h", "example.com", format!("/{}", "x".repeat(120)));
        let name = f.object_name();
        assert!(name.len() <= 63, "{}", name);
        assert!(!name.contains("--"));
    }

    #[test]
    fn route_spec_serializes_flat() {
        let spec = RouteSpec { fields: RouteSpecFields::new("", "example.com", ""), app_names: vec!["a".into()] };
        let v = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(v, serde_json::json!({"domain": "example.com", "appNames": ["a"]}));
    }

    #[test]
    fn condition_types_parse_by_wire_name() {
        assert_eq!(AppConditionType::parse("routesready"), Some(AppConditionType::RoutesReady));
        assert_eq!(TaskConditionType::parse("Succeeded"), Some(TaskConditionType::Succeeded));
        assert_eq!(RouteConditionType::parse("Succeeded"), None);
    }

    #[test]
    fn missing_status_reads_as_generation_zero() {
        let app = App::new("a", AppSpec::default());
        assert_eq!(app.observed_generation(), 0);
        assert_eq!(app.generation(), 0);
        assert!(app.conditions().is_empty());
    }
}
