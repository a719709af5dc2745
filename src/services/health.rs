use std::fmt;

/// Service health status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceHealth {
    Healthy,
    /// Running, but not doing useful work right now (e.g. node disconnected)
    Degraded(String),
    /// Stopped on an error that needs operator action
    Unhealthy(String),
    Starting,
    Stopping,
}

impl ServiceHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServiceHealth::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ServiceHealth::Degraded(_))
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, ServiceHealth::Unhealthy(_))
    }

    fn severity(&self) -> u8 {
        match self {
            ServiceHealth::Healthy => 0,
            ServiceHealth::Starting | ServiceHealth::Stopping => 1,
            ServiceHealth::Degraded(_) => 2,
            ServiceHealth::Unhealthy(_) => 3,
        }
    }

    /// The more severe of two statuses
    pub fn worst(self, other: ServiceHealth) -> ServiceHealth {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for ServiceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceHealth::Healthy => write!(f, "healthy"),
            ServiceHealth::Degraded(reason) => write!(f, "degraded: {}", reason),
            ServiceHealth::Unhealthy(reason) => write!(f, "unhealthy: {}", reason),
            ServiceHealth::Starting => write!(f, "starting"),
            ServiceHealth::Stopping => write!(f, "stopping"),
        }
    }
}
