use std::sync::Arc;

use hashbrown::HashMap;

use sluice_model::{Ingester, ServerConfig, User};
use sluice_store::{Registry, Tsdb};

use crate::services::auth::AuthService;
use crate::services::limiter::RateLimiter;
use crate::ws::Fanout;

/// Process-level context handed to every handler through Rocket's managed
/// state. Constructed once at ignition; teardown reverses at shutdown.
pub struct AppState {
    pub config: ServerConfig,
    pub registry: Registry,
    pub tsdb: Arc<dyn Tsdb>,
    /// Resource descriptors by name, including the internal `sys.users`
    /// table. The API never mutates these; ticks happen in the ingester
    /// process.
    pub resources: HashMap<String, Ingester>,
    pub limiter: RateLimiter,
    pub auth: AuthService,
    pub fanout: Arc<Fanout>,
}

impl AppState {
    pub fn resource(&self, name: &str) -> Option<&Ingester> {
        self.resources.get(name)
    }

    pub fn is_protected(&self, name: &str) -> bool {
        if name.starts_with("sys.") || name.starts_with("admin.") {
            return true;
        }
        self.resources.get(name).is_none_or(|ing| ing.protected)
    }

    /// Resource names a principal may see.
    pub fn visible_resources(&self, user: &User) -> Vec<String> {
        let mut names: Vec<String> = self
            .resources
            .keys()
            .filter(|name| user.is_admin() || !self.is_protected(name))
            .cloned()
            .collect();
        names.sort();
        names
    }
}
