// ABOUTME: HTTP-terminated MCP session table with idle-TTL sweeping
// ABOUTME: One session per client connection; tool calls are dispatched through the service

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::mcp_capability::InProcessMcpServer;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One MCP session. Each session owns its own capability instance (spec
/// section 3/4.5) so tool registrations and `list_changed` notifications
/// never leak across clients sharing the same process.
pub struct Session {
    pub id: String,
    pub server: Arc<InProcessMcpServer>,
    last_seen_ms: AtomicI64,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            server: Arc::new(InProcessMcpServer::new()),
            last_seen_ms: AtomicI64::new(now_ms()),
        }
    }

    pub fn touch(&self) {
        self.last_seen_ms.store(now_ms(), Ordering::SeqCst);
    }

    fn idle_for(&self) -> Duration {
        let elapsed_ms = (now_ms() - self.last_seen_ms.load(Ordering::SeqCst)).max(0);
        Duration::from_millis(elapsed_ms as u64)
    }
}

/// Concurrent session table. Sessions are created on the first `POST`
/// request with no `mcp-session-id` header and looked up by id thereafter
/// (spec section 4.5, "Request pipeline").
#[derive(Clone)]
pub struct SessionTable {
    sessions: Arc<DashMap<String, Arc<Session>>>,
    ttl: Duration,
}

impl SessionTable {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn create(&self) -> Arc<Session> {
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone()));
        self.sessions.insert(id, session.clone());
        session
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|e| {
            e.touch();
            e.value().clone()
        })
    }

    /// Idempotent: closing a session that was already removed (or never
    /// existed) is not an error.
    pub fn close(&self, id: &str) {
        self.sessions.remove(id);
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Every live session's capability instance, for broadcasting runtime
    /// tool (de)registration and list-changed notifications across all
    /// open sessions (spec section 4.1).
    #[must_use]
    pub fn all_servers(&self) -> Vec<Arc<InProcessMcpServer>> {
        self.sessions.iter().map(|e| e.value().server.clone()).collect()
    }

    /// Removes every session idle longer than the configured TTL.
    pub fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().idle_for() > ttl)
            .map(|e| e.key().clone())
            .collect();
        for id in &stale {
            self.sessions.remove(id);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "swept idle sessions");
        }
        stale.len()
    }

    /// Spawns the periodic sweeper task.
    pub fn spawn_sweeper(&self, interval: Duration) {
        let table = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = table.sweep();
                if removed > 0 {
                    info!(removed, "session sweep removed idle sessions");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_removes_only_idle_sessions() {
        let table = SessionTable::new(Duration::from_millis(0));
        let session = table.create();
        std::thread::sleep(Duration::from_millis(5));
        let removed = table.sweep();
        assert_eq!(removed, 1);
        assert!(table.get(&session.id).is_none());
    }

    #[test]
    fn close_is_idempotent() {
        let table = SessionTable::new(Duration::from_secs(60));
        table.close("never-existed");
        let session = table.create();
        table.close(&session.id);
        table.close(&session.id);
        assert_eq!(table.active_count(), 0);
    }
}
