//! Per-client isolation units, created lazily on first submission.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use super::{QuotaSnapshot, ResourceQuota, UserLevel};
use crate::sync::lock;

/// State owned by one connected client.
#[derive(Debug)]
pub struct ClientContext {
    id: String,
    quota: ResourceQuota,
    last_active: Mutex<Instant>,
}

impl ClientContext {
    pub fn new(id: impl Into<String>, quota: ResourceQuota) -> Self {
        Self {
            id: id.into(),
            quota,
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn quota(&self) -> &ResourceQuota {
        &self.quota
    }

    /// Tasks admitted and not yet completed.
    pub fn active_tasks(&self) -> u32 {
        self.quota.running()
    }

    pub fn max_concurrent_tasks(&self) -> u32 {
        self.quota.snapshot().max_concurrent_tasks
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_active) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        lock(&self.last_active).elapsed()
    }
}

/// Registry of client contexts keyed by client ID.
pub struct ClientManager {
    clients: RwLock<HashMap<String, Arc<ClientContext>>>,
    default_level: UserLevel,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::with_default_level(UserLevel::Basic)
    }

    /// New clients start on `level`.
    pub fn with_default_level(level: UserLevel) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            default_level: level,
        }
    }

    /// Get a client's context, creating it on first use.
    pub async fn get_or_create(&self, client_id: &str) -> Arc<ClientContext> {
        if let Some(client) = self.clients.read().await.get(client_id) {
            client.touch();
            return Arc::clone(client);
        }

        let mut clients = self.clients.write().await;
        let client = clients.entry(client_id.to_string()).or_insert_with(|| {
            tracing::debug!(
                client_id = %client_id,
                level = %self.default_level,
                "Created client context"
            );
            Arc::new(ClientContext::new(
                client_id,
                ResourceQuota::for_level(self.default_level),
            ))
        });
        client.touch();
        Arc::clone(client)
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<ClientContext>> {
        self.clients.read().await.get(client_id).cloned()
    }

    pub async fn remove(&self, client_id: &str) -> Option<Arc<ClientContext>> {
        self.clients.write().await.remove(client_id)
    }

    pub async fn set_user_level(&self, client_id: &str, level: UserLevel) {
        self.get_or_create(client_id).await.quota().set_user_level(level);
    }

    pub async fn snapshot(&self, client_id: &str) -> Option<QuotaSnapshot> {
        self.get(client_id).await.map(|c| c.quota().snapshot())
    }

    /// Run the daily reset on every client. Returns how many were reset.
    pub async fn reset_daily_quotas(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.quota().check_and_reset_daily_quota())
            .count()
    }

    /// Drop clients idle longer than `ttl`. Clients with running tasks, with
    /// usage counted against today's quota, or with a tier or limits other
    /// than the default are kept: a pruned client must come back exactly as
    /// a fresh one would.
    pub async fn prune_idle(&self, ttl: Duration) -> usize {
        let default_level = self.default_level;
        let default_limits = default_level.limits();
        let mut clients = self.clients.write().await;
        let before = clients.len();
        clients.retain(|_, c| {
            let quota = c.quota().snapshot();
            let customized = quota.user_level != default_level
                || (quota.max_total_tasks, quota.max_concurrent_tasks) != default_limits;
            customized || quota.running > 0 || quota.total_used > 0 || c.idle_for() < ttl
        });
        let pruned = before - clients.len();
        if pruned > 0 {
            tracing::debug!(count = pruned, "Pruned idle clients");
        }
        pruned
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}
