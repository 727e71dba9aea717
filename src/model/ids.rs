//! Newtype identifiers.
//!
//! Mirrors the teacher's `RequestId`/`DaemonId` wrappers (`request::types`), but over `i64`
//! for `BatchId`/`RequestId` per `SPEC_FULL.md` §3 ("Identity: integer `id`"). `DaemonId`
//! stays a `Uuid` — it never leaves the process and a random value is the cheapest way to
//! identify one live Lifecycle Engine worker.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! int_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

int_id!(BatchId);
int_id!(RequestId);

/// Identifies one live Lifecycle Engine / delivery worker process, for claim bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DaemonId(pub Uuid);

impl DaemonId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DaemonId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for DaemonId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for DaemonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
