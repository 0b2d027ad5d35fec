//! Network namespace access.
//!
//! The relay never creates namespaces. It only joins the namespace owned by an
//! existing process, through a [`NamespaceGateway`], and always switches back
//! afterwards via [`NamespaceSwitch`].

pub mod switch;

use std::fs::File;
use std::os::fd::AsFd;

use nix::sched::{setns, CloneFlags};
use nix::unistd::Pid;

use crate::error::NamespaceError;

pub use switch::NamespaceSwitch;

/// Capability to open, join and close network namespace handles.
pub trait NamespaceGateway: Send + Sync + 'static {
    type Handle: Send;

    /// Open the network namespace owned by `pid`.
    fn open(&self, pid: Pid) -> Result<Self::Handle, NamespaceError>;

    /// Open the namespace the calling thread is in right now.
    fn open_current(&self) -> Result<Self::Handle, NamespaceError>;

    /// Make `handle` the calling thread's ambient network namespace.
    fn set(&self, handle: &Self::Handle) -> Result<(), NamespaceError>;

    /// Release a handle.
    fn close(&self, handle: Self::Handle) {
        drop(handle);
    }
}

/// Gateway backed by `/proc/<pid>/ns/net` and `setns(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcNamespace;

impl ProcNamespace {
    pub fn new() -> Self {
        Self
    }
}

impl NamespaceGateway for ProcNamespace {
    type Handle = File;

    fn open(&self, pid: Pid) -> Result<File, NamespaceError> {
        File::open(format!("/proc/{}/ns/net", pid)).map_err(|source| NamespaceError::Open {
            pid: pid.as_raw(),
            source,
        })
    }

    fn open_current(&self) -> Result<File, NamespaceError> {
        // setns(2) moves only the calling thread, so the restore point is the
        // thread's namespace rather than the process leader's.
        File::open("/proc/thread-self/ns/net").map_err(NamespaceError::OpenCurrent)
    }

    fn set(&self, handle: &File) -> Result<(), NamespaceError> {
        setns(handle.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|errno| NamespaceError::Set(errno.into()))
    }
}
