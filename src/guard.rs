//! Fork-safety guard
//!
//! A socket shared across a process fork corrupts the request/response
//! stream, so every use of a connection first checks that the process is
//! still the one that created it.

use crate::core::error::{Error, Result};

/// Records the owning process at creation and rejects use after a fork
#[derive(Debug)]
pub(crate) struct ForkGuard {
    owner_pid: u32,
    inherit_socket: bool,
}

impl ForkGuard {
    pub(crate) fn new(inherit_socket: bool) -> Self {
        Self {
            owner_pid: std::process::id(),
            inherit_socket,
        }
    }

    /// Fail if the process changed since creation, unless inheriting was
    /// explicitly allowed or the caller is inside a `without_reconnect` block
    pub(crate) fn check(&self, bypass: bool) -> Result<()> {
        if bypass || self.inherit_socket || std::process::id() == self.owner_pid {
            Ok(())
        } else {
            Err(Error::Inherited(
                "tried to use a connection from a child process without reconnecting; \
                 reconnect after forking or set inherit_socket"
                    .to_string(),
            ))
        }
    }

    #[cfg(test)]
    pub(crate) fn pretend_forked(&mut self) {
        self.owner_pid = self.owner_pid.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_process_passes() {
        assert!(ForkGuard::new(false).check(false).is_ok());
    }

    #[test]
    fn changed_process_is_rejected() {
        let mut guard = ForkGuard::new(false);
        guard.pretend_forked();
        assert!(matches!(guard.check(false), Err(Error::Inherited(_))));
    }

    #[test]
    fn inherit_socket_suppresses_the_check() {
        let mut guard = ForkGuard::new(true);
        guard.pretend_forked();
        assert!(guard.check(false).is_ok());
    }

    #[test]
    fn bypass_suppresses_the_check() {
        let mut guard = ForkGuard::new(false);
        guard.pretend_forked();
        assert!(guard.check(true).is_ok());
    }
}
