//! Privilege detection
//!
//! OS reconfiguration needs root. The check sits behind a trait so handlers
//! can be exercised without running the test suite as root.

use nix::unistd::geteuid;

pub trait PrivilegeProbe: Send + Sync {
    fn is_privileged(&self) -> bool;
}

/// Root when the effective UID is 0
#[derive(Debug, Clone, Copy, Default)]
pub struct EffectivePrivilege;

impl PrivilegeProbe for EffectivePrivilege {
    fn is_privileged(&self) -> bool {
        geteuid().is_root()
    }
}

/// Fixed answer, for tests and dry runs
#[derive(Debug, Clone, Copy)]
pub struct StaticPrivilege(pub bool);

impl PrivilegeProbe for StaticPrivilege {
    fn is_privileged(&self) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_privilege_matches_euid() {
        assert_eq!(EffectivePrivilege.is_privileged(), geteuid().as_raw() == 0);
    }

    #[test]
    fn test_static_privilege() {
        assert!(StaticPrivilege(true).is_privileged());
        assert!(!StaticPrivilege(false).is_privileged());
    }
}
