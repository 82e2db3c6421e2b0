//! Maps external paths to application identifiers and keeps a mirrored view
//! of each application's instance for the presentation layer.

use appbox_common::{
    AppId, InstanceConfig, InstanceState, PoolEvent, PoolEventKind, Result, ServerAddress,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::instance::Instance;
use crate::pool::PoolManager;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub app_id: AppId,
    pub display_name: String,
    pub path: String,
    pub address: Option<ServerAddress>,
    pub state: InstanceState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedUrl {
    pub app_id: AppId,
    pub sub_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterStats {
    pub total_apps: usize,
    pub active_apps: usize,
    pub suspended_apps: usize,
    pub memory_usage_mb: u64,
}

type RouteTable = Arc<RwLock<HashMap<AppId, Route>>>;

fn read(routes: &RouteTable) -> RwLockReadGuard<'_, HashMap<AppId, Route>> {
    routes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(routes: &RouteTable) -> RwLockWriteGuard<'_, HashMap<AppId, Route>> {
    routes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `"/apps/"` -> `"/apps"`, `"/"` -> `""`.
fn normalize_base(base: &str) -> String {
    let trimmed = base.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// `"docs/a/"` -> `"/docs/a"`, `"/"` -> `""`.
fn normalize_sub_path(sub: &str) -> String {
    let trimmed = sub.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn apply_event(routes: &RouteTable, event: &PoolEvent) {
    let mut table = write(routes);
    let Some(route) = table.get_mut(&event.app_id) else {
        return;
    };
    match &event.kind {
        PoolEventKind::Created | PoolEventKind::Resumed => route.state = InstanceState::Active,
        PoolEventKind::Suspended => {
            route.state = InstanceState::Suspended;
            route.address = None;
        }
        PoolEventKind::Terminated => {
            route.state = InstanceState::Terminated;
            route.address = None;
        }
        PoolEventKind::Error { .. } => route.state = InstanceState::Error,
        PoolEventKind::ServerReady { port, url } => {
            route.address = Some(ServerAddress {
                port: *port,
                url: url.clone(),
            })
        }
        PoolEventKind::Access => {}
    }
}

pub struct Router {
    pool: Arc<PoolManager>,
    config: RouterConfig,
    base_path: String,
    routes: RouteTable,
    sync_task: JoinHandle<()>,
}

impl Router {
    /// Must be called inside a tokio runtime: route mirroring runs on a
    /// background task subscribed to pool events.
    pub fn new(pool: Arc<PoolManager>, config: RouterConfig) -> Self {
        let routes: RouteTable = Arc::new(RwLock::new(HashMap::new()));
        let mut events = pool.subscribe();
        let table = Arc::clone(&routes);
        let sync_task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => apply_event(&table, &event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Route sync lagged behind pool events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            base_path: normalize_base(&config.base_path),
            pool,
            config,
            routes,
            sync_task,
        }
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Split a pathname into identifier and sub-path. Paths outside the base
    /// prefix go to the default app with the full path as sub-path.
    pub fn parse_url(&self, pathname: &str) -> ParsedUrl {
        let remainder = if self.base_path.is_empty() {
            Some(pathname)
        } else {
            pathname
                .strip_prefix(self.base_path.as_str())
                .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        };

        let Some(remainder) = remainder else {
            return ParsedUrl {
                app_id: self.config.default_app.clone(),
                sub_path: pathname.to_string(),
            };
        };

        let remainder = remainder.trim_start_matches('/');
        if remainder.trim_end_matches('/').is_empty() {
            return ParsedUrl {
                app_id: self.config.default_app.clone(),
                sub_path: "/".to_string(),
            };
        }

        let (app_id, rest) = remainder.split_once('/').unwrap_or((remainder, ""));
        let sub_path = normalize_sub_path(rest);
        ParsedUrl {
            app_id: app_id.to_string(),
            sub_path: if sub_path.is_empty() {
                "/".to_string()
            } else {
                sub_path
            },
        }
    }

    /// Canonical URL for an identifier: the registered route path, or
    /// `base/app_id` for unregistered identifiers, followed by `sub_path`.
    pub fn generate_url(&self, app_id: &str, sub_path: Option<&str>) -> String {
        let prefix = read(&self.routes)
            .get(app_id)
            .map(|route| route.path.clone())
            .unwrap_or_else(|| self.canonical_path(app_id));
        let prefix = prefix.trim_end_matches('/');
        let sub = normalize_sub_path(sub_path.unwrap_or("/"));

        match (prefix.is_empty(), sub.is_empty()) {
            (true, true) => "/".to_string(),
            (_, true) => prefix.to_string(),
            _ => format!("{prefix}{sub}"),
        }
    }

    fn canonical_path(&self, app_id: &str) -> String {
        format!("{}/{}", self.base_path, app_id)
    }

    /// Register a route. Its state starts as `suspended` and is refreshed from
    /// the pool when an instance already exists.
    pub async fn register_app(
        &self,
        app_id: &str,
        display_name: &str,
        path: Option<&str>,
    ) -> Route {
        let mut route = Route {
            app_id: app_id.to_string(),
            display_name: display_name.to_string(),
            path: path
                .map(str::to_string)
                .unwrap_or_else(|| self.canonical_path(app_id)),
            address: None,
            state: InstanceState::Suspended,
        };
        if let Some(instance) = self.pool.peek(app_id).await {
            route.state = instance.state().await;
            route.address = instance.address().await;
        }
        info!(app_id, path = %route.path, "Registered route");
        write(&self.routes).insert(app_id.to_string(), route.clone());
        route
    }

    pub fn unregister_app(&self, app_id: &str) -> Option<Route> {
        write(&self.routes).remove(app_id)
    }

    pub fn get_route(&self, app_id: &str) -> Option<Route> {
        read(&self.routes).get(app_id).cloned()
    }

    pub fn routes(&self) -> Vec<Route> {
        let mut routes: Vec<Route> = read(&self.routes).values().cloned().collect();
        routes.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        routes
    }

    /// Create or resume the instance behind a registered route. Returns
    /// `None` for unregistered identifiers.
    pub async fn navigate_to_app(&self, app_id: &str) -> Result<Option<Arc<Instance>>> {
        let Some(route) = self.get_route(app_id) else {
            debug!(app_id, "Navigation to unregistered app");
            return Ok(None);
        };
        let config = InstanceConfig::new(app_id, route.display_name).with_suspend_after(
            Duration::from_millis(self.pool.config().default_suspend_after_ms),
        );
        let instance = self.pool.create_or_get(config).await?;
        self.refresh_route(&instance).await;
        Ok(Some(instance))
    }

    /// Like navigation, but registers on the fly and gives the instance a
    /// longer idle threshold since it may sit unused for a while.
    pub async fn preload_app(&self, app_id: &str, display_name: Option<&str>) -> Result<()> {
        let display_name = match self.get_route(app_id) {
            Some(route) => route.display_name,
            None => {
                self.register_app(app_id, display_name.unwrap_or(app_id), None)
                    .await
                    .display_name
            }
        };
        let config = InstanceConfig::new(app_id, display_name).with_suspend_after(
            Duration::from_millis(self.config.preload_suspend_after_ms),
        );
        let instance = self.pool.create_or_get(config).await?;
        self.refresh_route(&instance).await;
        info!(app_id, "Preloaded app");
        Ok(())
    }

    pub async fn get_stats(&self) -> RouterStats {
        let metrics = self.pool.metrics().await;
        RouterStats {
            total_apps: metrics.total_instances,
            active_apps: metrics.active_instances,
            suspended_apps: metrics.suspended_instances,
            memory_usage_mb: metrics.memory_mb,
        }
    }

    async fn refresh_route(&self, instance: &Instance) {
        let state = instance.state().await;
        let address = instance.address().await;
        if let Some(route) = write(&self.routes).get_mut(instance.app_id()) {
            route.state = state;
            route.address = address;
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.sync_task.abort();
    }
}
