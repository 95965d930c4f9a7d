//! Strongly-typed identifiers shared by the pipeline crates.
//!
//! All identifiers are UUIDv7 so that natural ordering follows creation time,
//! which the job store relies on for "newest first" listings.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a tenant (organisation) owning jobs and rate-limit budgets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

/// Identifier of a user acting inside a tenant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

/// Identifier of a batch job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

/// Identifier of a fire-and-forget task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

/// Identifier of a dead-letter entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(Uuid);

macro_rules! uuid_id {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Allocate a fresh time-ordered identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s.trim())
                    .map(Self)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))
            }
        }
    };
}

uuid_id!(TenantId, "TenantId");
uuid_id!(UserId, "UserId");
uuid_id!(JobId, "JobId");
uuid_id!(TaskId, "TaskId");
uuid_id!(DeadLetterId, "DeadLetterId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_sort_by_creation() {
        let first = JobId::new();
        let second = JobId::new();
        assert!(first < second);
    }

    #[test]
    fn parse_rejects_garbage_with_type_name() {
        let err = "not-a-uuid".parse::<TaskId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(ref msg) if msg.starts_with("TaskId")));
    }

    #[test]
    fn display_round_trips_through_from_str() {
        let id = TenantId::new();
        let parsed: TenantId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serializes_as_bare_uuid() {
        let id = DeadLetterId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }
}
