//! Relay manager - owns every running forward.

pub mod datagram;
pub mod driver;
pub mod pump;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nix::unistd::Pid;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{Direction, ForwardConfig, Protocol};
use crate::error::{RelayError, Result};
use crate::forward::Forward;
use crate::netns::{NamespaceGateway, NamespaceSwitch, ProcNamespace};
use crate::socket::{SocketFactory, SocketFile};

use self::driver::ForwardContext;

pub use pump::RelayStats;

/// Snapshot of one running forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardInfo {
    /// Position of the descriptor in the list passed to setup.
    pub index: usize,
    pub direction: Direction,
    pub protocol: Protocol,
    /// Address the listener is bound to; ip forwards show the resolved port.
    pub local: String,
    pub remote: String,
    /// Live connection relays (or datagram sessions).
    pub active_relays: usize,
}

#[derive(Debug)]
struct RunningForward {
    sandbox: Pid,
    forward: Arc<Forward>,
    local: String,
    cancel: CancellationToken,
    relays: Arc<AtomicUsize>,
}

/// Supervisor for the forwards of one or more sandboxed processes.
///
/// Each forward gets a child token of the manager's root token; every accept
/// loop and relay task is spawned on the manager's tracker, so
/// [`RelayManager::shutdown`] can wait for all of them.
#[derive(Debug)]
pub struct RelayManager<G: NamespaceGateway = ProcNamespace> {
    switch: Arc<NamespaceSwitch<G>>,
    forwards: HashMap<usize, RunningForward>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Default for RelayManager<ProcNamespace> {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayManager<ProcNamespace> {
    /// Create a manager that joins namespaces through `/proc`.
    pub fn new() -> Self {
        Self::with_gateway(ProcNamespace::new())
    }
}

impl<G: NamespaceGateway> RelayManager<G> {
    /// Create a manager that joins namespaces through `gateway`.
    pub fn with_gateway(gateway: G) -> Self {
        Self {
            switch: Arc::new(NamespaceSwitch::new(gateway)),
            forwards: HashMap::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Start every enabled forward in `forwards`, in order.
    ///
    /// Stops at the first forward that cannot be started and returns its
    /// error, prefixed with the descriptor. Forwards started before the
    /// failure keep running. On success every listener is bound and accepting.
    pub async fn setup(&mut self, pid: Pid, forwards: &[ForwardConfig]) -> Result<()> {
        for (index, config) in forwards.iter().enumerate() {
            if !config.is_enabled() {
                tracing::debug!("Skipping disabled forward #{}", index);
                continue;
            }
            self.start_forward(pid, index, config)
                .await
                .map_err(|e| RelayError::for_forward(config, e))?;
        }
        Ok(())
    }

    /// Start a single forward under `index`.
    ///
    /// A disabled descriptor is accepted and starts nothing.
    pub async fn start_forward(&mut self, pid: Pid, index: usize, config: &ForwardConfig) -> Result<()> {
        if self.forwards.contains_key(&index) {
            return Err(RelayError::AlreadyRunning(index));
        }
        let Some(forward) = Forward::resolve(config)? else {
            return Ok(());
        };
        let forward = Arc::new(forward);

        tracing::info!("Starting socket {} forwarding: {}", forward.direction, forward);

        let factory = SocketFactory::new(self.switch.clone(), pid);
        let listener = factory
            .listen(forward.listen_scope(), forward.protocol, &forward.local)
            .await?;
        let socket_file = SocketFile::for_endpoint(&forward.local);
        let local = listener
            .inet_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| forward.local.to_string());

        let ctx = ForwardContext {
            index,
            forward: forward.clone(),
            factory,
            cancel: self.shutdown.child_token(),
            tracker: self.tracker.clone(),
            relays: Arc::new(AtomicUsize::new(0)),
        };
        self.forwards.insert(
            index,
            RunningForward {
                sandbox: pid,
                forward,
                local,
                cancel: ctx.cancel.clone(),
                relays: ctx.relays.clone(),
            },
        );
        self.tracker.spawn(async move {
            let _socket_file = socket_file;
            driver::run(listener, ctx).await;
        });

        Ok(())
    }

    /// Stop the forward under `index`: its listener closes and its relays are
    /// torn down. Returns false if nothing was running there.
    pub fn stop_forward(&mut self, index: usize) -> bool {
        match self.forwards.remove(&index) {
            Some(running) => {
                running.cancel.cancel();
                tracing::info!(
                    "Stopped socket {} forwarding for pid {}: {}",
                    running.forward.direction,
                    running.sandbox,
                    running.forward
                );
                true
            }
            None => false,
        }
    }

    /// Running forwards, ordered by index.
    pub fn list_forwards(&self) -> Vec<ForwardInfo> {
        let mut infos: Vec<ForwardInfo> = self
            .forwards
            .iter()
            .map(|(&index, running)| ForwardInfo {
                index,
                direction: running.forward.direction,
                protocol: running.forward.protocol,
                local: running.local.clone(),
                remote: running.forward.remote.to_string(),
                active_relays: running.relays.load(Ordering::SeqCst),
            })
            .collect();
        infos.sort_by_key(|info| info.index);
        infos
    }

    pub fn forward_count(&self) -> usize {
        self.forwards.len()
    }

    pub fn is_forwarding(&self, index: usize) -> bool {
        self.forwards.contains_key(&index)
    }

    /// Live relays across all forwards.
    pub fn active_relays(&self) -> usize {
        self.forwards
            .values()
            .map(|running| running.relays.load(Ordering::SeqCst))
            .sum()
    }

    /// Cancel every forward and wait for all of their tasks to finish.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        self.forwards.clear();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!("Relay manager shut down");
    }
}

impl<G: NamespaceGateway> Drop for RelayManager<G> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Start `forwards` for the sandboxed process `pid` and return the manager
/// running them. An empty list starts nothing and succeeds.
pub async fn proxy_setup(pid: Pid, forwards: &[ForwardConfig]) -> Result<RelayManager> {
    let mut manager = RelayManager::new();
    manager.setup(pid, forwards).await?;
    Ok(manager)
}
