use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Liveness reporting for the long-running loops of the collector.
///
/// The RUM collector runs several background loops next to the HTTP
/// server: the source-map archive scanner and the session replay upload
/// workers. The process only deserves traffic while those loops keep
/// reporting.
///
/// Each loop registers a component and reports before its deadline:
///   - a component that misses its deadline is `Stalled`
///   - a component that reports `Unhealthy` fails the check until it recovers
///   - a component that reports `Degraded` fails the check for good, later
///     reports from it are ignored
///
/// The overall status combines the components with a `HealthStrategy`.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status, see `HealthStrategy`
    pub healthy: bool,
    /// Current status of each registered component, for display
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

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy, may recover
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
    /// Terminal: the component gave up and will not recover without a restart
    Degraded(String),
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => until.gt(&time::OffsetDateTime::now_utc()),
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ComponentStatus::Degraded(_))
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Asynchronously report healthy, returns when the message is queued.
    /// Must be called more frequently than the configured deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    pub async fn report_degraded(&self, reason: impl Into<String>) {
        self.report_status(ComponentStatus::Degraded(reason.into()))
            .await
    }

    /// Asynchronously report component status, returns when the message is queued.
    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HealthStrategy {
    /// All components must be healthy for the registry to be healthy
    All,
    /// At least one component must be healthy for the registry to be healthy
    Any,
}

impl std::str::FromStr for HealthStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "all" => Ok(HealthStrategy::All),
            "any" => Ok(HealthStrategy::Any),
            _ => Err(format!("Unknown Health Strategy: {s}, must be ALL or ANY")),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    strategy: HealthStrategy,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self::new_with_strategy(name, HealthStrategy::All)
    }

    pub fn new_with_strategy(name: &str, strategy: HealthStrategy) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            strategy,
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Ok(mut map) = components.write() else {
                    // Poisoned lock: the probes will fail and the process restart
                    warn!("poisoned HealthRegistry lock");
                    continue;
                };
                if map
                    .get(&message.component)
                    .is_some_and(ComponentStatus::is_terminal)
                {
                    continue;
                }
                drop(map.insert(message.component, message.status));
            }
        });

        registry
    }

    /// Registers a new component in the registry. The returned handle should be passed
    /// to the component, to allow it to frequently report its health status.
    pub async fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Returns the overall process status, computed from the status of all the components
    /// currently registered. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned lock", self.name);
            return HealthStatus::default();
        };

        let result = HealthStatus {
            // "All" starts healthy and any failing component flips it,
            // "Any" starts unhealthy and any passing component flips it
            healthy: !components.is_empty() && self.strategy == HealthStrategy::All,
            components: Default::default(),
        };
        let now = time::OffsetDateTime::now_utc();

        let result = components
            .iter()
            .fold(result, |mut result, (name, status)| {
                match status {
                    ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                        if self.strategy == HealthStrategy::Any {
                            result.healthy = true;
                        }
                        drop(result.components.insert(name.clone(), status.clone()))
                    }
                    ComponentStatus::HealthyUntil(_) => {
                        if self.strategy == HealthStrategy::All {
                            result.healthy = false;
                        }
                        drop(
                            result
                                .components
                                .insert(name.clone(), ComponentStatus::Stalled),
                        )
                    }
                    _ => {
                        if self.strategy == HealthStrategy::All {
                            result.healthy = false;
                        }
                        drop(result.components.insert(name.clone(), status.clone()))
                    }
                }
                result
            });
        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}
