//! Lock modes requested for loads

use serde::{Deserialize, Serialize};

/// Lock mode of a load, ordered by strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum LockMode {
    /// No lock; instances read this way are recorded with `Read`
    #[default]
    None,
    /// Row was read in the current transaction, version checked on upgrade
    Read,
    /// Shared row lock (`FOR SHARE`)
    PessimisticRead,
    /// Exclusive row lock (`FOR UPDATE`)
    Upgrade,
    /// Exclusive row lock failing immediately when unavailable
    UpgradeNoWait,
    /// Held by rows written in this unit of work; cannot be requested by a load
    Write,
}

impl LockMode {
    fn level(self) -> u8 {
        match self {
            LockMode::None => 0,
            LockMode::Read => 5,
            LockMode::PessimisticRead => 8,
            LockMode::Upgrade | LockMode::UpgradeNoWait | LockMode::Write => 10,
        }
    }

    pub fn greater_than(self, other: LockMode) -> bool {
        self.level() > other.level()
    }

    /// Whether the statement itself must acquire a row lock
    pub fn requires_row_lock(self) -> bool {
        matches!(
            self,
            LockMode::PessimisticRead | LockMode::Upgrade | LockMode::UpgradeNoWait
        )
    }

    /// Whether a load may ask for this mode
    pub fn is_requestable(self) -> bool {
        !matches!(self, LockMode::Write)
    }

    /// Mode recorded on an entry when a row is first read with `self`
    pub fn acquired(self) -> LockMode {
        match self {
            LockMode::None => LockMode::Read,
            other => other,
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LockMode::None => "NONE",
            LockMode::Read => "READ",
            LockMode::PessimisticRead => "PESSIMISTIC_READ",
            LockMode::Upgrade => "UPGRADE",
            LockMode::UpgradeNoWait => "UPGRADE_NOWAIT",
            LockMode::Write => "WRITE",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_ordering() {
        assert!(LockMode::Upgrade.greater_than(LockMode::Read));
        assert!(LockMode::Read.greater_than(LockMode::None));
        assert!(!LockMode::UpgradeNoWait.greater_than(LockMode::Upgrade));
        assert!(LockMode::Upgrade.greater_than(LockMode::PessimisticRead));
    }

    #[test]
    fn test_acquired_and_requestable() {
        assert_eq!(LockMode::None.acquired(), LockMode::Read);
        assert_eq!(LockMode::Upgrade.acquired(), LockMode::Upgrade);
        assert!(!LockMode::Write.is_requestable());
        assert!(LockMode::UpgradeNoWait.requires_row_lock());
        assert!(!LockMode::Read.requires_row_lock());
    }
}
