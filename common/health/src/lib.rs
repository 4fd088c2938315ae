use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

/// Liveness reporting for the long-running loops of the gateway.
///
/// The gateway should only receive traffic while every loop it depends on
/// (the rdkafka producer poll loop first and foremost) keeps reporting in.
/// Each loop registers a component with a deadline and must report healthy
/// again before that deadline expires, otherwise it is considered stalled.
///
/// The process is healthy when at least one component is registered and all
/// of them are currently healthy.

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet
    Starting,
    HealthyUntil(Instant),
    Unhealthy,
    /// Computed on read when a HealthyUntil deadline has passed
    Stalled,
}

impl ComponentStatus {
    pub fn is_healthy_at(&self, now: Instant) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(until) if *until > now)
    }
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Must be called more often than the deadline given at registration.
    /// Never blocks on I/O, so it is safe to call from rdkafka callbacks.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            Instant::now() + self.deadline,
        ));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        let mut components = self
            .components
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        components.insert(self.component.clone(), status);
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a component in Starting state and returns the handle it
    /// reports through.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Can be used directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let now = Instant::now();
        let components = self
            .components
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        for (name, component) in components.iter() {
            let component = match component {
                ComponentStatus::HealthyUntil(_) if !component.is_healthy_at(now) => {
                    ComponentStatus::Stalled
                }
                other => *other,
            };
            if !component.is_healthy_at(now) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), component);
        }

        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}
