/// Background service lifecycle
///
/// The head tracker and the broadcaster loop run as services. The manager
/// starts them in dependency and priority order, hands each the shared
/// shutdown signal, and stops them in reverse order.
mod health;

pub use health::ServiceHealth;

use crate::logger::{self, LogTag};
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long `stop_all` waits for each task to wind down
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Service: Send + Sync {
    /// Unique service identifier
    fn name(&self) -> &'static str;

    /// Lower starts earlier and stops later
    fn priority(&self) -> i32 {
        100
    }

    /// Services that must be started before this one
    fn dependencies(&self) -> Vec<&'static str> {
        vec![]
    }

    async fn initialize(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// Spawn the service's tasks; they must exit once `shutdown` fires
    async fn start(&mut self, shutdown: ShutdownSignal) -> Result<Vec<JoinHandle<()>>, String>;

    async fn stop(&mut self) -> Result<(), String> {
        Ok(())
    }

    async fn health(&self) -> ServiceHealth {
        ServiceHealth::Healthy
    }
}

pub struct ServiceManager {
    services: HashMap<&'static str, Box<dyn Service>>,
    handles: HashMap<&'static str, Vec<JoinHandle<()>>>,
    shutdown: ShutdownSignal,
}

impl ServiceManager {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            services: HashMap::new(),
            handles: HashMap::new(),
            shutdown,
        }
    }

    pub fn register(&mut self, service: Box<dyn Service>) {
        let name = service.name();
        self.services.insert(name, service);
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Start all registered services in dependency and priority order
    pub async fn start_all(&mut self) -> Result<(), String> {
        let names: Vec<&'static str> = self.services.keys().copied().collect();
        let ordered = self.resolve_startup_order(&names)?;

        logger::info(LogTag::System, &format!("Service startup order: {:?}", ordered));

        for service_name in ordered {
            if self.handles.contains_key(service_name) {
                continue;
            }
            if let Some(service) = self.services.get_mut(service_name) {
                logger::debug(LogTag::System, &format!("Initializing service: {}", service_name));
                service.initialize().await?;

                let handles = service.start(self.shutdown.clone()).await?;
                self.handles.insert(service_name, handles);

                logger::info(LogTag::System, &format!("Service started: {}", service_name));
            }
        }

        Ok(())
    }

    /// Signal shutdown and stop running services in reverse startup order
    pub async fn stop_all(&mut self) -> Result<(), String> {
        self.shutdown.trigger();

        let running: Vec<&'static str> = self.handles.keys().copied().collect();
        let mut ordered = self.resolve_startup_order(&running)?;
        ordered.reverse();

        for service_name in ordered {
            if let Some(service) = self.services.get_mut(service_name) {
                if let Err(e) = service.stop().await {
                    logger::warning(
                        LogTag::System,
                        &format!("Service stop error for {}: {}", service_name, e),
                    );
                }
            }

            if let Some(handles) = self.handles.remove(service_name) {
                for handle in handles {
                    if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                        logger::warning(
                            LogTag::System,
                            &format!("Service {} did not stop within {:?}", service_name, STOP_TIMEOUT),
                        );
                    }
                }
            }

            logger::info(LogTag::System, &format!("Service stopped: {}", service_name));
        }

        Ok(())
    }

    /// Dependencies first, then ascending priority among independent services
    fn resolve_startup_order(&self, services: &[&'static str]) -> Result<Vec<&'static str>, String> {
        fn visit(
            name: &'static str,
            services: &HashMap<&'static str, Box<dyn Service>>,
            ordered: &mut Vec<&'static str>,
            visited: &mut HashSet<&'static str>,
            visiting: &mut HashSet<&'static str>,
        ) -> Result<(), String> {
            if visited.contains(name) {
                return Ok(());
            }
            if !visiting.insert(name) {
                return Err(format!("Circular dependency detected for service: {}", name));
            }

            if let Some(service) = services.get(name) {
                let mut deps = service.dependencies();
                deps.sort_by_key(|dep| services.get(dep).map(|s| s.priority()).unwrap_or(100));
                for dep in deps {
                    visit(dep, services, ordered, visited, visiting)?;
                }
            }

            visiting.remove(name);
            visited.insert(name);
            ordered.push(name);
            Ok(())
        }

        let mut roots = services.to_vec();
        roots.sort_by_key(|name| (self.services.get(name).map(|s| s.priority()).unwrap_or(100), *name));

        let mut ordered = Vec::new();
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();
        for name in roots {
            visit(name, &self.services, &mut ordered, &mut visited, &mut visiting)?;
        }
        Ok(ordered)
    }

    pub async fn get_health(&self) -> HashMap<&'static str, ServiceHealth> {
        let mut health = HashMap::new();
        for (name, service) in &self.services {
            health.insert(*name, service.health().await);
        }
        health
    }
}
