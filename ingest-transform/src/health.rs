use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

/// Liveness of the long-running loops of the service.
///
/// Each loop registers a component with a deadline and must report healthy more
/// often than that deadline. The service is healthy when every registered
/// component is: one stalled or unhealthy component fails the probe.
#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet
    Starting,
    /// Reported healthy, must report again before the deadline
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
    /// Missed its deadline
    Stalled,
}

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

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Must be called more often than the deadline the component registered with.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut components) => {
                components.insert(self.component.clone(), status);
            }
            Err(_) => warn!(component = %self.component, "health registry lock is poisoned"),
        }
    }
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        info!(registry = %self.name, component, "registered health component");
        handle
    }

    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let Ok(components) = self.components.read() else {
            return HealthStatus::default();
        };

        let components: HashMap<String, ComponentStatus> = components
            .iter()
            .map(|(name, status)| {
                let status = match status {
                    ComponentStatus::HealthyUntil(until) if *until <= now => {
                        ComponentStatus::Stalled
                    }
                    other => other.clone(),
                };
                (name.clone(), status)
            })
            .collect();

        let healthy = !components.is_empty()
            && components
                .values()
                .all(|status| matches!(status, ComponentStatus::HealthyUntil(_)));

        if !healthy {
            warn!(registry = %self.name, "health check failed: {:?}", components);
        }

        HealthStatus {
            healthy,
            components,
        }
    }
}
