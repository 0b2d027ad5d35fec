//! Namespace-scoped socket factory.

use std::io;
use std::sync::Arc;

use nix::unistd::Pid;
use tokio::sync::oneshot;

use super::{native, Connection, Listener};
use crate::config::Protocol;
use crate::error::{RelayError, Result};
use crate::forward::{Endpoint, Scope};
use crate::netns::{NamespaceGateway, NamespaceSwitch};

/// Creates listeners and outbound connections in either the caller's
/// namespace or the sandboxed process's.
///
/// `setns(2)` affects only the calling thread, and the switch must not
/// straddle an `.await` where the task could move to another worker. Caller
/// scope work runs on the blocking pool. Sandbox scope work runs on a
/// short-lived thread of its own, so a thread that failed to switch back ends
/// with the operation instead of returning to a pool.
pub struct SocketFactory<G> {
    switch: Arc<NamespaceSwitch<G>>,
    sandbox: Pid,
}

impl<G> Clone for SocketFactory<G> {
    fn clone(&self) -> Self {
        Self {
            switch: self.switch.clone(),
            sandbox: self.sandbox,
        }
    }
}

impl<G: NamespaceGateway> SocketFactory<G> {
    pub fn new(switch: Arc<NamespaceSwitch<G>>, sandbox: Pid) -> Self {
        Self { switch, sandbox }
    }

    /// The process whose namespace [`Scope::Sandbox`] refers to.
    pub fn sandbox_pid(&self) -> Pid {
        self.sandbox
    }

    /// Bind and listen on `endpoint` inside `scope`.
    pub async fn listen(&self, scope: Scope, protocol: Protocol, endpoint: &Endpoint) -> Result<Listener> {
        let endpoint = endpoint.clone();
        let raw = self
            .scoped(scope, move || native::listen(protocol, &endpoint))
            .await?;
        Ok(Listener::from_raw(raw)?)
    }

    /// Connect to `endpoint` from inside `scope`.
    pub async fn connect(
        &self,
        scope: Scope,
        protocol: Protocol,
        endpoint: &Endpoint,
    ) -> Result<Connection> {
        let endpoint = endpoint.clone();
        let raw = self
            .scoped(scope, move || native::connect(protocol, &endpoint))
            .await?;
        Ok(Connection::from_raw(raw)?)
    }

    async fn scoped<T, F>(&self, scope: Scope, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        match scope {
            Scope::Caller => tokio::task::spawn_blocking(op)
                .await
                .map_err(|e| RelayError::Io(io::Error::other(e)))?
                .map_err(RelayError::from),
            Scope::Sandbox => {
                let switch = self.switch.clone();
                let pid = self.sandbox;
                let (done, result) = oneshot::channel();
                std::thread::Builder::new()
                    .name("nsrelay-netns".to_string())
                    .spawn(move || {
                        let _ = done.send(switch.run_in(pid, op));
                    })
                    .map_err(RelayError::Io)?;
                result
                    .await
                    .map_err(|_| RelayError::Io(io::Error::other("namespace thread exited without a result")))?
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::error::NamespaceError;

    const HOST: i32 = 1;
    const SANDBOX: i32 = 77;

    thread_local! {
        static AMBIENT: Cell<i32> = const { Cell::new(HOST) };
    }

    fn ambient() -> io::Result<i32> {
        Ok(AMBIENT.with(Cell::get))
    }

    /// Keeps namespace state per thread, as `setns(2)` does.
    #[derive(Clone, Default)]
    struct ThreadGateway {
        fail_restore: Arc<AtomicBool>,
        restore_points: Arc<Mutex<Vec<i32>>>,
    }

    impl NamespaceGateway for ThreadGateway {
        type Handle = i32;

        fn open(&self, pid: Pid) -> std::result::Result<i32, NamespaceError> {
            Ok(pid.as_raw())
        }

        fn open_current(&self) -> std::result::Result<i32, NamespaceError> {
            let current = AMBIENT.with(Cell::get);
            self.restore_points.lock().push(current);
            Ok(current)
        }

        fn set(&self, handle: &i32) -> std::result::Result<(), NamespaceError> {
            if *handle == HOST && self.fail_restore.load(Ordering::SeqCst) {
                return Err(NamespaceError::Set(io::Error::from_raw_os_error(1)));
            }
            AMBIENT.with(|ambient| ambient.set(*handle));
            Ok(())
        }
    }

    fn factory(gateway: &ThreadGateway) -> SocketFactory<ThreadGateway> {
        SocketFactory::new(
            Arc::new(NamespaceSwitch::new(gateway.clone())),
            Pid::from_raw(SANDBOX),
        )
    }

    #[tokio::test]
    async fn test_sandbox_scope_runs_inside_and_caller_scope_outside() {
        let gateway = ThreadGateway::default();
        let factory = factory(&gateway);
        assert_eq!(factory.scoped(Scope::Sandbox, ambient).await.unwrap(), SANDBOX);
        assert_eq!(factory.scoped(Scope::Caller, ambient).await.unwrap(), HOST);
    }

    #[tokio::test]
    async fn test_failed_restore_leaves_no_thread_behind_in_sandbox() {
        let gateway = ThreadGateway::default();
        let factory = factory(&gateway);

        gateway.fail_restore.store(true, Ordering::SeqCst);
        let err = factory.scoped(Scope::Sandbox, ambient).await.unwrap_err();
        assert!(matches!(err, RelayError::Namespace(NamespaceError::Restore(_))));
        gateway.fail_restore.store(false, Ordering::SeqCst);

        for _ in 0..32 {
            assert_eq!(factory.scoped(Scope::Caller, ambient).await.unwrap(), HOST);
            assert_eq!(factory.scoped(Scope::Sandbox, ambient).await.unwrap(), SANDBOX);
        }
        assert!(gateway.restore_points.lock().iter().all(|&point| point == HOST));
    }

    #[tokio::test]
    async fn test_panicking_operation_reports_error() {
        let gateway = ThreadGateway::default();
        let factory = factory(&gateway);
        let err = factory
            .scoped(Scope::Sandbox, || -> io::Result<()> { panic!("socket op blew up") })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Io(_)));
        assert_eq!(factory.scoped(Scope::Caller, ambient).await.unwrap(), HOST);
    }
}
