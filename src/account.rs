//! Account identity and the current-account holder.
//!
//! The active account is explicit state with an explicit `switch`
//! transition, never ambient globals: the coordinator asks the context
//! who is active and performs its flush-then-clear dance on switch.
use std::sync::RwLock;

use serde::Deserialize;

/// Which sync protocol an account speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    /// On-device only; state changes never leave the local store
    Local,
    /// Fever-style API (api_key form posts, `?api&...` verbs)
    Fever,
    /// Google Reader-style API (ClientLogin session, edit-tag posts)
    GoogleReader,
}

impl AccountKind {
    /// Whether read-state changes are owed to a remote service.
    pub fn is_remote_syncing(self) -> bool {
        !matches!(self, Self::Local)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Fever => "fever",
            Self::GoogleReader => "google-reader",
        }
    }
}

/// A configured account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Stable identifier; also keys the per-account disk cache file
    pub id: String,
    pub name: String,
    pub kind: AccountKind,
}

/// Holder of the currently active account.
pub struct AccountContext {
    current: RwLock<Account>,
}

impl AccountContext {
    pub fn new(initial: Account) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// The active account (cloned snapshot).
    pub fn active(&self) -> Account {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Make `new` the active account, returning the one it replaced.
    pub fn switch(&self, new: Account) -> Account {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let old = std::mem::replace(&mut *guard, new);
        tracing::debug!(from = %old.id, to = %guard.id, "account context switched");
        old
    }
}
