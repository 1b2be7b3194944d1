//! Wire shapes for transporting handles across processes.
//!
//! Each handle type exports a stable, serde-serializable shape carrying the
//! resolved key, the identity, and the configured TTL. Importing re-binds
//! the shape to the importing provider's adapter, namespace, clock, and
//! dispatcher -- no runtime pointers ever cross the wire. When importer and
//! exporter share an adapter, the imported handle operates on the same
//! underlying record.
//!
//! The local expiration memo is a cache, not state: it is never serialized.
//!
//! The `version` field allows forward-compatible evolution; providers
//! reject unknown versions instead of guessing.

use serde::{Deserialize, Serialize};

/// Current wire format version.
pub const WIRE_VERSION: u32 = 1;

/// Errors from importing a wire shape.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unsupported handle wire version {found} (supported: {WIRE_VERSION})")]
    UnsupportedVersion { found: u32 },
}

/// Wire shape of an exclusive lock handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockHandleWire {
    pub version: u32,
    /// Resolved (un-namespaced) key.
    pub key: String,
    pub owner: String,
    pub ttl_ms: Option<u64>,
}

/// Wire shape of a semaphore handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemaphoreHandleWire {
    pub version: u32,
    /// Resolved (un-namespaced) key.
    pub key: String,
    pub slot_id: String,
    pub limit: u32,
    pub ttl_ms: Option<u64>,
}

/// Wire shape of a shared-lock handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedLockHandleWire {
    pub version: u32,
    /// Resolved (un-namespaced) key.
    pub key: String,
    pub lock_id: String,
    /// Reader-side capacity.
    pub limit: u32,
    pub ttl_ms: Option<u64>,
}

/// Rejects wire shapes from a future format.
pub(crate) fn check_version(found: u32) -> Result<(), WireError> {
    if found == WIRE_VERSION {
        Ok(())
    } else {
        Err(WireError::UnsupportedVersion { found })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_wire_json_round_trip() {
        let wire = LockHandleWire {
            version: WIRE_VERSION,
            key: "jobs".to_string(),
            owner: "worker-1".to_string(),
            ttl_ms: Some(300_000),
        };
        let json = serde_json::to_string(&wire).unwrap();
        assert_eq!(serde_json::from_str::<LockHandleWire>(&json).unwrap(), wire);
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let wire = SemaphoreHandleWire {
            version: WIRE_VERSION,
            key: "pool".to_string(),
            slot_id: "s-1".to_string(),
            limit: 4,
            ttl_ms: None,
        };
        let json = serde_json::to_value(&wire).unwrap();
        assert!(json.get("slotId").is_some());
        assert!(json.get("ttlMs").is_some());
        assert!(json.get("slot_id").is_none());
    }

    #[test]
    fn null_ttl_survives_the_wire() {
        let wire = SharedLockHandleWire {
            version: WIRE_VERSION,
            key: "doc".to_string(),
            lock_id: "r-1".to_string(),
            limit: 8,
            ttl_ms: None,
        };
        let json = serde_json::to_string(&wire).unwrap();
        let back: SharedLockHandleWire = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ttl_ms, None);
    }

    #[test]
    fn version_check_rejects_unknown() {
        assert!(check_version(WIRE_VERSION).is_ok());
        let err = check_version(WIRE_VERSION + 1).unwrap_err();
        assert!(matches!(
            err,
            WireError::UnsupportedVersion { found } if found == WIRE_VERSION + 1
        ));
    }
}
