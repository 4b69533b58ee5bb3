//! Manager: root of the lifecycle tree.
//!
//! Owns the listeners, the connection roster, and the shutdown phases.
//! The first shutdown request stops accepting and lets in-flight
//! handlers finish; the second forces every connection to destroy. Both
//! are broadcast down the tree.

use crate::config::Config;
use crate::error::ServerError;
use crate::server::{Listener, ListenerKind, ServerContext};
use crate::worker::Roster;
use std::sync::Arc;
use std::time::Duration;

/// How often the drain loop re-checks the roster after `asap`.
const DRAIN_TICK: Duration = Duration::from_millis(100);

/// How long `now` waits for connections to reach the destroyed state
/// before giving up the process anyway.
const NOW_GRACE: Duration = Duration::from_secs(5);

/// The server root: listeners plus every live connection.
pub struct Manager {
    ctx: Arc<ServerContext>,
    conns: Roster,
    listeners: Roster,
}

impl Manager {
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let ctx = ServerContext::new(config)?;
        Ok(Self {
            ctx,
            conns: Roster::new(),
            listeners: Roster::new(),
        })
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    /// Requests shutdown: the first call is the `asap` phase, any later
    /// call escalates to `now`.
    pub fn shutdown(&self) {
        if self.ctx.shutdown.asap() == 0 {
            tracing::info!("shutdown requested, draining");
            self.ctx.shutdown.request_asap();
        } else {
            tracing::info!("forced shutdown");
            self.ctx.shutdown.request_now();
        }
    }

    /// Binds both ports, serves until shutdown completes, and drains.
    pub async fn run(&self) -> Result<(), ServerError> {
        let http = Listener::bind(
            ListenerKind::Http,
            self.ctx.config.network.http_addr,
            self.conns.clone(),
        )
        .await?;
        let binary = Listener::bind(
            ListenerKind::Binary,
            self.ctx.config.network.binary_addr,
            self.conns.clone(),
        )
        .await?;

        http.start(self.ctx.clone());
        binary.start(self.ctx.clone());
        let _http = self.listeners.attach(Arc::new(http));
        let _binary = self.listeners.attach(Arc::new(binary));

        // Wait for the asap phase; the future is enabled before the flag
        // is re-checked so a signal cannot slip between the two.
        loop {
            let mut notified = std::pin::pin!(self.ctx.shutdown.notify.notified());
            notified.as_mut().enable();
            if self.ctx.shutdown.asap() != 0 {
                break;
            }
            notified.await;
        }

        let asap = self.ctx.shutdown.asap();
        self.listeners.shutdown_all(asap, 0);
        self.conns.shutdown_all(asap, 0);

        // Drain: connections destroy as their handlers finish; escalate
        // immediately when `now` arrives.
        while self.ctx.shutdown.now() == 0 && !self.conns.is_empty() {
            tokio::select! {
                _ = self.ctx.shutdown.notify.notified() => {}
                _ = tokio::time::sleep(DRAIN_TICK) => {}
            }
        }

        if !self.conns.is_empty() {
            let now = self.ctx.shutdown.now().max(asap);
            tracing::info!("destroying {} remaining connections", self.conns.len());
            self.conns.shutdown_all(asap, now);

            let deadline = tokio::time::Instant::now() + NOW_GRACE;
            while !self.conns.is_empty() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(DRAIN_TICK).await;
            }
        }

        self.ctx.workers.shutdown();
        tracing::info!("server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.network.http_addr = "127.0.0.1:0".parse().unwrap();
        config.network.binary_addr = "127.0.0.1:0".parse().unwrap();
        config.network.loops = 1;
        config.limits.worker_threads = 2;
        config
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_and_shutdown() {
        let manager = Arc::new(Manager::new(test_config()).unwrap());
        let runner = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.run().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("shutdown must complete")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_phase_escalation() {
        let manager = Arc::new(Manager::new(test_config()).unwrap());
        manager.shutdown();
        assert_ne!(manager.ctx.shutdown.asap(), 0);
        assert_eq!(manager.ctx.shutdown.now(), 0);
        manager.shutdown();
        assert_ne!(manager.ctx.shutdown.now(), 0);
    }
}
