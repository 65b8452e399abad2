//! Route listener — owns one bound entry port for one rule.
//!
//! Accepts inbound connections and spawns an independent relay task per
//! connection; accepting never waits on a relay. Shutdown is graceful:
//! [`RouteListener::stop`] cancels the accept loop and waits for the port to
//! be released, but relays already in flight keep running until their own
//! natural close (unbounded drain).

use crate::relay;
use portroute_core::{RouteError, RouteResult, RouteRule};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A running accept loop bound to one rule's entry port.
pub struct RouteListener {
    rule: RouteRule,
    /// The address the OS actually bound (differs from the rule when the
    /// rule requested port 0, which tests use for an OS-assigned port).
    local_addr: SocketAddr,
    /// Sender half of the cancel channel; sending signals the accept loop
    /// to shut down.
    cancel_tx: mpsc::Sender<()>,
    /// Accept-loop task; taken on the first `stop` so stopping twice is a
    /// no-op.
    accept_task: Option<JoinHandle<()>>,
}

impl RouteListener {
    /// Bind the rule's entry port and start accepting.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Bind`] when the port is unavailable (already in
    /// use, permission denied). Fatal for this rule's activation only.
    pub async fn start(rule: RouteRule, connect_timeout: Duration) -> RouteResult<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], rule.enter_port));
        let listener = TcpListener::bind(addr).await.map_err(|e| RouteError::Bind {
            port: rule.enter_port,
            source: e,
        })?;
        let local_addr = listener.local_addr().map_err(|e| RouteError::Bind {
            port: rule.enter_port,
            source: e,
        })?;

        info!(
            rule = %rule.key(),
            name = %rule.name,
            addr = %local_addr,
            "route listener started"
        );

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let shared_rule = Arc::new(rule.clone());
        let accept_task = tokio::spawn(accept_loop(
            listener,
            shared_rule,
            cancel_rx,
            connect_timeout,
        ));

        Ok(Self {
            rule,
            local_addr,
            cancel_tx,
            accept_task: Some(accept_task),
        })
    }

    /// The rule this listener forwards for.
    pub fn rule(&self) -> &RouteRule {
        &self.rule
    }

    /// The address the OS actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections and release the bound port.
    ///
    /// Returns once the accept loop has ended and dropped its socket, i.e.
    /// once the port is free. Relays already in flight are not terminated.
    /// Calling `stop` on an already-stopped listener is a no-op.
    pub async fn stop(&mut self) {
        let Some(task) = self.accept_task.take() else {
            return;
        };
        let _ = self.cancel_tx.send(()).await;
        let _ = task.await;
        info!(rule = %self.rule.key(), "route listener stopped");
    }
}

/// Accept connections until cancelled. Accept errors are logged and do not
/// stop the loop; relay failures are contained in the per-connection task.
async fn accept_loop(
    listener: TcpListener,
    rule: Arc<RouteRule>,
    mut cancel_rx: mpsc::Receiver<()>,
    connect_timeout: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(rule = %rule.key(), "accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!(rule = %rule.key(), peer = %peer_addr, "inbound connection accepted");
                        let rule = rule.clone();
                        tokio::spawn(async move {
                            if let Err(e) = relay::run(stream, &rule, connect_timeout).await {
                                warn!(rule = %rule.key(), peer = %peer_addr, error = %e, "relay failed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(rule = %rule.key(), error = %e, "accept failed");
                    }
                }
            }
        }
    }
}
