//! kfx routes: bind and unbind Apps on Routes.
//!
//! A Route's `appNames` is a set shared by every App mapped to it, so each
//! change is a read/merge/write against the latest copy. Lost races are
//! retried by the generic client.

#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use kfx_client::{Client, ClientError, ResourceStore};
use kfx_core::kinds::RouteSpecFields;
use kfx_core::{Route, RouteSpec};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("App {app:?} is not bound to Route {route:?}")]
pub struct BindingNotFound {
    pub app: String,
    pub route: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error(transparent)]
    BindingNotFound(BindingNotFound),
    #[error(transparent)]
    Client(ClientError),
}

impl RouteError {
    pub fn is_not_found(&self) -> bool {
        match self {
            RouteError::BindingNotFound(_) => true,
            RouteError::Client(e) => e.is_not_found(),
        }
    }
}

impl From<ClientError> for RouteError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Mutation(inner) => match inner.downcast::<BindingNotFound>() {
                Ok(b) => RouteError::BindingNotFound(b),
                Err(other) => RouteError::Client(ClientError::Mutation(other)),
            },
            other => RouteError::Client(other),
        }
    }
}

/// Desired Route for `fields` carrying only `app`.
pub fn desired_route(fields: &RouteSpecFields, app: &str) -> Route {
    Route::new(&fields.object_name(), RouteSpec { fields: fields.clone(), app_names: vec![app.to_string()] })
}

/// Upsert merger: keep the stored identity (resourceVersion, labels, ...)
/// and union the stored binding set with the desired one. A stored Route
/// serving a different address is never rewritten.
pub fn bind_merger(desired: &Route, existing: &Route) -> Result<Route> {
    if existing.spec.fields != desired.spec.fields {
        bail!(
            "Route {:?} serves {} and cannot be bound to {}",
            existing.metadata.name.as_deref().unwrap_or_default(),
            existing.spec.fields,
            desired.spec.fields
        );
    }
    let mut merged = desired.clone();
    merged.metadata = existing.metadata.clone();
    merged.status = existing.status.clone();
    let mut apps = existing.spec.app_names.clone();
    for app in &desired.spec.app_names {
        if !apps.iter().any(|a| a == app) {
            apps.push(app.clone());
        }
    }
    merged.spec.app_names = apps;
    Ok(merged)
}

/// Transform mutator removing `app`; fails with [`BindingNotFound`] when absent.
pub fn unbind_mutator(app: &str) -> impl FnMut(&mut Route) -> Result<()> + Send + '_ {
    move |route| {
        match route.spec.app_names.iter().position(|a| a == app) {
            Some(i) => {
                route.spec.app_names.remove(i);
                Ok(())
            }
            None => Err(BindingNotFound { app: app.to_string(), route: route.metadata.name.clone().unwrap_or_default() }.into()),
        }
    }
}

pub struct RouteBinder<S> {
    routes: Client<Route, S>,
}

impl<S: ResourceStore<Route>> RouteBinder<S> {
    pub fn new(routes: Client<Route, S>) -> Self { Self { routes } }

    pub fn routes(&self) -> &Client<Route, S> { &self.routes }

    /// Ensure the Route for `fields` exists and lists `app`.
    pub async fn bind(&self, namespace: &str, fields: &RouteSpecFields, app: &str, cancel: &CancellationToken) -> Result<Route, RouteError> {
        let desired = desired_route(fields, app);
        let route = self.routes.upsert(namespace, &desired, bind_merger, cancel).await?;
        counter!("kfx_routes_bind_total", 1u64, "op" => "bind");
        info!(ns = %namespace, route = %fields, app = %app, "bound");
        Ok(route)
    }

    /// Remove `app` from the named Route. The Route itself is kept even when
    /// no Apps remain.
    pub async fn unbind(&self, namespace: &str, route_name: &str, app: &str, cancel: &CancellationToken) -> Result<Route, RouteError> {
        let route = self.routes.transform(namespace, route_name, unbind_mutator(app), cancel).await?;
        counter!("kfx_routes_bind_total", 1u64, "op" => "unbind");
        info!(ns = %namespace, route = %route_name, app = %app, "unbound");
        Ok(route)
    }
}
