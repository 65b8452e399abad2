//! Route registry — the authoritative map from rule identity to running
//! listener.
//!
//! The map is the only shared mutable state in the proxy core. Its lock is
//! held only for map reads and writes, never across a port bind or a drain:
//! `add` reserves the identity with a [`RouteEntry::Starting`] placeholder
//! before binding, and `remove` takes the instance out of the map before
//! stopping it. Two concurrent `add` calls for the same identity therefore
//! resolve to exactly one winner, and two concurrent `remove` calls to
//! exactly one — the loser observes `DuplicateRule` / `NotFound`.

use crate::listener::RouteListener;
use portroute_core::{RouteError, RouteResult, RouteRule, RuleKey};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Runtime state bound to one installed rule.
struct RouteInstance {
    rule: RouteRule,
    listener: RouteListener,
}

/// Map entry lifecycle. `Starting` reserves the identity while the bind is
/// in progress; `Running` is the stable listening state. Draining happens
/// outside the map: `remove` takes the instance out first, then stops it.
enum RouteEntry {
    Starting,
    Running(RouteInstance),
}

/// Map plus the shutdown flag, guarded together so an `add` racing a
/// `shutdown` cannot slip a listener into a drained registry.
struct RegistryInner {
    routes: HashMap<RuleKey, RouteEntry>,
    closed: bool,
}

/// Concurrency-safe registry of installed routes.
///
/// The only component permitted to start and stop [`RouteListener`]s.
pub struct RouteRegistry {
    inner: Mutex<RegistryInner>,
    /// Outbound connect timeout handed to every listener's relays.
    connect_timeout: Duration,
}

impl RouteRegistry {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                routes: HashMap::new(),
                closed: false,
            }),
            connect_timeout,
        }
    }

    /// Install a rule: start a listener on its entry port and record it.
    ///
    /// # Errors
    ///
    /// - [`RouteError::DuplicateRule`] when a route with the same identity
    ///   triple is already installed (or currently being installed). The
    ///   existing route is unaffected.
    /// - [`RouteError::Bind`] when the entry port cannot be bound; the
    ///   registry is left unchanged.
    /// - [`RouteError::Closed`] after [`RouteRegistry::shutdown`].
    pub async fn add(&self, rule: RouteRule) -> RouteResult<()> {
        let key = rule.key();

        // Reserve the identity before the (slow) bind so a concurrent add
        // for the same triple fails fast instead of racing the bind.
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(RouteError::Closed);
            }
            if inner.routes.contains_key(&key) {
                return Err(RouteError::DuplicateRule(key));
            }
            inner.routes.insert(key.clone(), RouteEntry::Starting);
        }

        match RouteListener::start(rule.clone(), self.connect_timeout).await {
            Ok(mut listener) => {
                {
                    let mut inner = self.inner.lock().await;
                    if !inner.closed {
                        inner
                            .routes
                            .insert(key.clone(), RouteEntry::Running(RouteInstance { rule, listener }));
                        info!(rule = %key, "route installed");
                        return Ok(());
                    }
                }
                // Shutdown drained the map while we were binding: the fresh
                // listener must not outlive the registry.
                listener.stop().await;
                Err(RouteError::Closed)
            }
            Err(e) => {
                self.inner.lock().await.routes.remove(&key);
                warn!(rule = %key, error = %e, "route activation failed");
                Err(e)
            }
        }
    }

    /// Uninstall a route: stop accepting on its entry port, wait for the
    /// port to be released, and drop the instance. In-flight relays drain
    /// naturally.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotFound`] when no installed route matches the
    /// key. A route whose bind is still in progress is reported the same
    /// way — its `add` has not completed yet.
    pub async fn remove(&self, key: &RuleKey) -> RouteResult<()> {
        let mut instance = {
            let mut inner = self.inner.lock().await;
            match inner.routes.get(key) {
                Some(RouteEntry::Running(_)) => {}
                Some(RouteEntry::Starting) | None => {
                    return Err(RouteError::NotFound(key.to_string()))
                }
            }
            match inner.routes.remove(key) {
                Some(RouteEntry::Running(instance)) => instance,
                _ => unreachable!("entry checked as Running under the same lock"),
            }
        };

        // Drain outside the lock so other identities are not blocked.
        info!(rule = %key, "draining route");
        instance.listener.stop().await;
        info!(rule = %key, "route removed");
        Ok(())
    }

    /// Point-in-time snapshot of the installed rules.
    pub async fn list_all(&self) -> Vec<RouteRule> {
        let inner = self.inner.lock().await;
        inner
            .routes
            .values()
            .filter_map(|entry| match entry {
                RouteEntry::Running(instance) => Some(instance.rule.clone()),
                RouteEntry::Starting => None,
            })
            .collect()
    }

    /// Whether a route for this identity is installed. A reservation whose
    /// bind has not completed does not count — same view as `list_all` and
    /// `remove`.
    pub async fn contains(&self, key: &RuleKey) -> bool {
        matches!(
            self.inner.lock().await.routes.get(key),
            Some(RouteEntry::Running(_))
        )
    }

    /// Number of installed routes.
    pub async fn count(&self) -> usize {
        self.inner
            .lock()
            .await
            .routes
            .values()
            .filter(|entry| matches!(entry, RouteEntry::Running(_)))
            .count()
    }

    /// Stop every installed route and refuse further adds. Used on server
    /// shutdown.
    pub async fn shutdown(&self) {
        let instances: Vec<RouteInstance> = {
            let mut inner = self.inner.lock().await;
            inner.closed = true;
            inner
                .routes
                .drain()
                .filter_map(|(_, entry)| match entry {
                    RouteEntry::Running(instance) => Some(instance),
                    RouteEntry::Starting => None,
                })
                .collect()
        };

        for mut instance in instances {
            instance.listener.stop().await;
        }
        info!("all routes stopped");
    }

    /// Insert a bare reservation, as a racing `add` would while its bind is
    /// in progress.
    #[cfg(test)]
    async fn reserve(&self, key: RuleKey) {
        self.inner
            .lock()
            .await
            .routes
            .insert(key, RouteEntry::Starting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Backend that answers every connection with `test1` and closes.
    async fn reply_backend() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let _ = stream.write_all(b"test1").await;
                });
            }
        });
        addr
    }

    /// Pick a free loopback port by binding and dropping an ephemeral socket.
    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn rule(name: &str, enter_port: u16, backend: std::net::SocketAddr) -> RouteRule {
        RouteRule::new(name, enter_port, backend.ip().to_string(), backend.port(), "")
    }

    #[tokio::test]
    async fn test_add_starts_forwarding() {
        let backend = reply_backend().await;
        let port = free_port().await;
        let registry = RouteRegistry::new(CONNECT_TIMEOUT);

        registry.add(rule("r1", port, backend)).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"test1");

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let backend = reply_backend().await;
        let port = free_port().await;
        let registry = RouteRegistry::new(CONNECT_TIMEOUT);

        registry.add(rule("first", port, backend)).await.unwrap();

        // Same triple, different metadata: still a duplicate.
        let result = registry.add(rule("second", port, backend)).await;
        assert!(matches!(result, Err(RouteError::DuplicateRule(_))));
        assert_eq!(registry.count().await, 1);

        // The original route keeps working.
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"test1");

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_adds_have_one_winner() {
        let backend = reply_backend().await;
        let port = free_port().await;
        let registry = Arc::new(RouteRegistry::new(CONNECT_TIMEOUT));

        let r1 = rule("caller-a", port, backend);
        let r2 = rule("caller-b", port, backend);
        let reg1 = registry.clone();
        let reg2 = registry.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { reg1.add(r1).await }),
            tokio::spawn(async move { reg2.add(r2).await }),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1, "exactly one add wins");
        let loser = if a.is_err() { a } else { b };
        assert!(matches!(loser, Err(RouteError::DuplicateRule(_))));
        assert_eq!(registry.count().await, 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_stops_forwarding() {
        let backend = reply_backend().await;
        let port = free_port().await;
        let registry = RouteRegistry::new(CONNECT_TIMEOUT);

        let r = rule("r1", port, backend);
        let key = r.key();
        registry.add(r).await.unwrap();
        registry.remove(&key).await.unwrap();

        // New connections must now be refused.
        let result = TcpStream::connect(("127.0.0.1", port)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_remove_twice_reports_not_found() {
        let backend = reply_backend().await;
        let port = free_port().await;
        let registry = RouteRegistry::new(CONNECT_TIMEOUT);

        let r = rule("r1", port, backend);
        let key = r.key();
        registry.add(r).await.unwrap();
        registry.remove(&key).await.unwrap();

        let result = registry.remove(&key).await;
        assert!(matches!(result, Err(RouteError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_leaves_other_routes_running() {
        let backend = reply_backend().await;
        let port_a = free_port().await;
        let port_b = free_port().await;
        let registry = RouteRegistry::new(CONNECT_TIMEOUT);

        registry.add(rule("a", port_a, backend)).await.unwrap();
        let r_b = rule("b", port_b, backend);
        let key_b = r_b.key();
        registry.add(r_b).await.unwrap();

        registry.remove(&key_b).await.unwrap();
        assert!(TcpStream::connect(("127.0.0.1", port_b)).await.is_err());

        let mut client = TcpStream::connect(("127.0.0.1", port_a)).await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"test1");

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_after_remove_rebinds_port() {
        let backend = reply_backend().await;
        let port = free_port().await;
        let registry = RouteRegistry::new(CONNECT_TIMEOUT);

        let r = rule("r1", port, backend);
        let key = r.key();
        registry.add(r.clone()).await.unwrap();
        registry.remove(&key).await.unwrap();
        registry.add(r).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"test1");

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_registry_unchanged() {
        let held = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = held.local_addr().unwrap().port();
        let registry = RouteRegistry::new(CONNECT_TIMEOUT);

        let r = RouteRule::new("clash", port, "127.0.0.1", 1, "");
        let key = r.key();
        let result = registry.add(r).await;
        assert!(matches!(result, Err(RouteError::Bind { .. })));
        assert!(!registry.contains(&key).await);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_add_after_shutdown_is_rejected() {
        let backend = reply_backend().await;
        let port = free_port().await;
        let registry = RouteRegistry::new(CONNECT_TIMEOUT);

        registry.add(rule("early", port, backend)).await.unwrap();
        registry.shutdown().await;

        // No listener may start once the registry is drained.
        let late_port = free_port().await;
        let result = registry.add(rule("late", late_port, backend)).await;
        assert!(matches!(result, Err(RouteError::Closed)));
        assert_eq!(registry.count().await, 0);
        assert!(TcpStream::connect(("127.0.0.1", late_port)).await.is_err());
    }

    #[tokio::test]
    async fn test_pending_reservation_is_not_observable_as_installed() {
        let backend = reply_backend().await;
        let port = free_port().await;
        let registry = RouteRegistry::new(CONNECT_TIMEOUT);

        let r = rule("pending", port, backend);
        let key = r.key();
        registry.reserve(key.clone()).await;

        // A bind still in progress is invisible to readers but blocks a
        // competing add and cannot be removed yet.
        assert!(!registry.contains(&key).await);
        assert_eq!(registry.count().await, 0);
        assert!(registry.list_all().await.is_empty());
        assert!(matches!(
            registry.remove(&key).await,
            Err(RouteError::NotFound(_))
        ));
        assert!(matches!(
            registry.add(r).await,
            Err(RouteError::DuplicateRule(_))
        ));
    }

    #[tokio::test]
    async fn test_list_all_snapshots_installed_rules() {
        let backend = reply_backend().await;
        let port_a = free_port().await;
        let port_b = free_port().await;
        let registry = RouteRegistry::new(CONNECT_TIMEOUT);

        registry.add(rule("a", port_a, backend)).await.unwrap();
        registry.add(rule("b", port_b, backend)).await.unwrap();

        let mut names: Vec<String> = registry
            .list_all()
            .await
            .into_iter()
            .map(|r| r.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        registry.shutdown().await;
    }
}
