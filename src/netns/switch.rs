//! Serialized switching of the ambient network namespace.
//!
//! Every scoped operation follows the same protocol:
//!
//! 1. open the target namespace handle
//! 2. take the process-wide switch lock and open the current namespace as the
//!    restore point
//! 3. switch into the target
//! 4. run the socket operation
//! 5. switch back, close the restore handle, close the target handle
//!
//! Steps 2-5 run under [`SWITCH_LOCK`], so no two switch windows overlap
//! anywhere in the process. A socket keeps the namespace it was created in, so
//! anything returned from step 4 stays usable after the switch back.

use std::io;

use nix::unistd::Pid;
use parking_lot::Mutex;

use super::NamespaceGateway;
use crate::error::{NamespaceError, RelayError};

/// Held for the whole switch-in/operate/switch-out window.
static SWITCH_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Runs operations inside another process's network namespace.
#[derive(Debug)]
pub struct NamespaceSwitch<G> {
    gateway: G,
}

impl<G: NamespaceGateway> NamespaceSwitch<G> {
    pub fn new(gateway: G) -> Self {
        Self { gateway }
    }

    /// Access the underlying gateway.
    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Run `op` with the calling thread switched into `pid`'s network namespace.
    ///
    /// The ambient namespace is restored before returning on every path. If
    /// the restore itself fails, whatever `op` produced is dropped and the
    /// restore error is returned. The calling thread is then left in the
    /// target namespace and must not run anything else, so callers run this
    /// on a thread of its own.
    pub fn run_in<T, F>(&self, pid: Pid, op: F) -> Result<T, RelayError>
    where
        F: FnOnce() -> io::Result<T>,
    {
        let target = self.gateway.open(pid)?;

        let _serial = SWITCH_LOCK.lock();

        // Reopened on every call: the restore point is wherever this thread is now.
        let restore = match self.gateway.open_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.gateway.close(target);
                return Err(e.into());
            }
        };

        let entered = Entered::enter(&self.gateway, restore, target)?;
        let result = op();
        let left = entered.leave();

        match (result, left) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), Ok(())) => Err(e.into()),
            (_, Err(e)) => Err(e.into()),
        }
    }
}

/// Guard for a thread that has switched into a foreign namespace.
///
/// Dropping it without calling [`Entered::leave`] (a panicking operation)
/// still switches back and releases both handles.
struct Entered<'a, G: NamespaceGateway> {
    gateway: &'a G,
    restore: Option<G::Handle>,
    target: Option<G::Handle>,
}

impl<'a, G: NamespaceGateway> Entered<'a, G> {
    fn enter(gateway: &'a G, restore: G::Handle, target: G::Handle) -> Result<Self, NamespaceError> {
        if let Err(e) = gateway.set(&target) {
            gateway.close(restore);
            gateway.close(target);
            return Err(e);
        }
        Ok(Self {
            gateway,
            restore: Some(restore),
            target: Some(target),
        })
    }

    fn leave(mut self) -> Result<(), NamespaceError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), NamespaceError> {
        let mut result = Ok(());
        if let Some(restore) = self.restore.take() {
            if let Err(e) = self.gateway.set(&restore) {
                tracing::error!("Failed to switch back to the original network namespace: {}", e);
                result = Err(match e {
                    NamespaceError::Set(source) => NamespaceError::Restore(source),
                    other => other,
                });
            }
            self.gateway.close(restore);
        }
        if let Some(target) = self.target.take() {
            self.gateway.close(target);
        }
        result
    }
}

impl<G: NamespaceGateway> Drop for Entered<'_, G> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
