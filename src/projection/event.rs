//! Typed view of decoded registry events.
//!
//! Decoded fields come from the chain and are untrusted: every accessor
//! checks presence and type, and accepts the encodings a node or decoder
//! plausibly produces (JSON numbers, decimal strings, `0x` hex strings).

use std::fmt;

use alloy::primitives::U256;
use serde_json::{Map, Value};

use crate::chain::DecodedEvent;

/// A field that is missing or does not have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Field name in the decoded payload
    pub field: &'static str,
    /// What was wrong with it
    pub reason: String,
}

impl FieldError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field `{}`: {}", self.field, self.reason)
    }
}

impl std::error::Error for FieldError {}

/// Every event kind the projection understands, plus a catch-all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A worker announced itself
    WorkerRegistered {
        /// Worker address
        worker: String,
        /// Profile content reference
        info_reference: Option<String>,
    },
    /// A verifier vouched for a worker
    WorkerVerified {
        /// Worker address
        worker: String,
        /// Verifier address
        verifier: String,
    },
    /// A job was posted
    JobCreated {
        /// Contract job id
        job_id: u64,
        /// Creator address
        creator: String,
        /// Reward amount
        reward: U256,
        /// Unix deadline
        deadline: i64,
    },
    /// A worker took a job
    JobAssigned {
        /// Contract job id
        job_id: u64,
        /// Worker address
        worker: String,
    },
    /// A job's result was accepted
    JobCompleted {
        /// Contract job id
        job_id: u64,
        /// Score given to the result
        quality_score: i64,
    },
    /// An open job was withdrawn
    JobCancelled {
        /// Contract job id
        job_id: u64,
    },
    /// A worker's reputation changed
    ReputationUpdated {
        /// Worker address
        worker: String,
        /// Reputation before
        old_reputation: i64,
        /// Reputation after
        new_reputation: i64,
        /// Reason string from the contract
        reason: String,
        /// Job that caused the change, when the payload names one
        related_job_id: Option<u64>,
    },
    /// Anything else; stored but never projected
    Unknown {
        /// Name reported by the decoder
        name: String,
    },
}

impl RegistryEvent {
    /// Map a decoded event onto its typed variant.
    ///
    /// Names outside the known set become [`RegistryEvent::Unknown`].
    ///
    /// # Errors
    ///
    /// Returns a [`FieldError`] when a known event is missing a field or a
    /// field has the wrong shape.
    pub fn parse(decoded: &DecodedEvent) -> Result<Self, FieldError> {
        let f = &decoded.fields;
        let event = match decoded.event_name.as_str() {
            "WorkerRegistered" => Self::WorkerRegistered {
                worker: address(f, "worker")?,
                info_reference: optional_string(f, "info_cid")?,
            },
            "WorkerVerified" => Self::WorkerVerified {
                worker: address(f, "worker")?,
                verifier: address(f, "verifier")?,
            },
            "JobCreated" => Self::JobCreated {
                job_id: db_id(f, "job_id")?,
                creator: address(f, "creator")?,
                reward: amount(f, "reward")?,
                deadline: int(f, "deadline")?,
            },
            "JobAssigned" => Self::JobAssigned {
                job_id: db_id(f, "job_id")?,
                worker: address(f, "worker")?,
            },
            "JobCompleted" => Self::JobCompleted {
                job_id: db_id(f, "job_id")?,
                quality_score: int(f, "quality_score")?,
            },
            "JobCancelled" => Self::JobCancelled {
                job_id: db_id(f, "job_id")?,
            },
            "ReputationUpdated" => Self::ReputationUpdated {
                worker: address(f, "worker")?,
                old_reputation: int(f, "old_reputation")?,
                new_reputation: int(f, "new_reputation")?,
                reason: string(f, "reason")?,
                related_job_id: match f.get("job_id") {
                    None | Some(Value::Null) => None,
                    Some(_) => Some(db_id(f, "job_id")?),
                },
            },
            other => Self::Unknown {
                name: other.to_string(),
            },
        };
        Ok(event)
    }

    /// Event name as stored in `contract_events`.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::WorkerRegistered { .. } => "WorkerRegistered",
            Self::WorkerVerified { .. } => "WorkerVerified",
            Self::JobCreated { .. } => "JobCreated",
            Self::JobAssigned { .. } => "JobAssigned",
            Self::JobCompleted { .. } => "JobCompleted",
            Self::JobCancelled { .. } => "JobCancelled",
            Self::ReputationUpdated { .. } => "ReputationUpdated",
            Self::Unknown { name } => name,
        }
    }

    /// Job whose on-chain record must be fetched before projecting.
    #[must_use]
    pub const fn hydration_target(&self) -> Option<u64> {
        match self {
            Self::JobCreated { job_id, .. } | Self::JobCompleted { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }
}

fn get<'a>(fields: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, FieldError> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(FieldError::new(name, "missing")),
        Some(value) => Ok(value),
    }
}

fn string(fields: &Map<String, Value>, name: &'static str) -> Result<String, FieldError> {
    match get(fields, name)? {
        Value::String(s) => Ok(s.clone()),
        other => Err(FieldError::new(name, format!("expected string, got {other}"))),
    }
}

fn optional_string(
    fields: &Map<String, Value>,
    name: &'static str,
) -> Result<Option<String>, FieldError> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(FieldError::new(name, format!("expected string, got {other}"))),
    }
}

/// Lowercase `0x` + 40 hex digit address.
fn address(fields: &Map<String, Value>, name: &'static str) -> Result<String, FieldError> {
    let raw = string(fields, name)?;
    let hex = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .ok_or_else(|| FieldError::new(name, format!("address without 0x prefix: {raw}")))?;
    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(FieldError::new(name, format!("malformed address: {raw}")));
    }
    Ok(format!("0x{}", hex.to_ascii_lowercase()))
}

fn amount(fields: &Map<String, Value>, name: &'static str) -> Result<U256, FieldError> {
    match get(fields, name)? {
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| FieldError::new(name, format!("not an unsigned integer: {n}"))),
        Value::String(s) => parse_u256(s).ok_or_else(|| FieldError::new(name, format!("not an unsigned integer: {s}"))),
        other => Err(FieldError::new(name, format!("expected integer, got {other}"))),
    }
}

fn uint(fields: &Map<String, Value>, name: &'static str) -> Result<u64, FieldError> {
    let value = amount(fields, name)?;
    u64::try_from(value).map_err(|_| FieldError::new(name, format!("{value} does not fit in 64 bits")))
}

/// Unsigned id that also fits an SQLite INTEGER.
fn db_id(fields: &Map<String, Value>, name: &'static str) -> Result<u64, FieldError> {
    let value = uint(fields, name)?;
    if i64::try_from(value).is_err() {
        return Err(FieldError::new(name, format!("{value} exceeds the storable id range")));
    }
    Ok(value)
}

fn int(fields: &Map<String, Value>, name: &'static str) -> Result<i64, FieldError> {
    let value = uint(fields, name)?;
    i64::try_from(value).map_err(|_| FieldError::new(name, format!("{value} out of range")))
}

fn parse_u256(s: &str) -> Option<U256> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) if !hex.is_empty() => U256::from_str_radix(hex, 16).ok(),
        Some(_) => None,
        None if !s.is_empty() => U256::from_str_radix(s, 10).ok(),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const WORKER: &str = "0x00000000000000000000000000000000000000BB";

    #[test]
    fn test_parse_job_created_mixed_encodings() {
        let decoded = DecodedEvent::new(
            "JobCreated",
            json!({
                "job_id": "0x7",
                "creator": "0x00000000000000000000000000000000000000AA",
                "reward": "1000",
                "deadline": 1_735_689_600u64,
            }),
        );

        let event = RegistryEvent::parse(&decoded).unwrap();
        assert_eq!(
            event,
            RegistryEvent::JobCreated {
                job_id: 7,
                creator: "0x00000000000000000000000000000000000000aa".to_string(),
                reward: U256::from(1000u64),
                deadline: 1_735_689_600,
            }
        );
        assert_eq!(event.hydration_target(), Some(7));
    }

    #[test]
    fn test_missing_field_is_reported() {
        let decoded = DecodedEvent::new("JobAssigned", json!({ "job_id": "7" }));
        let err = RegistryEvent::parse(&decoded).unwrap_err();
        assert_eq!(err.field, "worker");
        assert_eq!(err.to_string(), "field `worker`: missing");
    }

    #[test]
    fn test_wrong_types_are_rejected() {
        let decoded = DecodedEvent::new(
            "JobCompleted",
            json!({ "job_id": "seven", "quality_score": 90 }),
        );
        assert_eq!(RegistryEvent::parse(&decoded).unwrap_err().field, "job_id");

        let decoded = DecodedEvent::new("JobCompleted", json!({ "job_id": -1, "quality_score": 90 }));
        assert!(RegistryEvent::parse(&decoded).is_err());

        let decoded = DecodedEvent::new("WorkerVerified", json!({ "worker": "0xbb", "verifier": WORKER }));
        assert_eq!(RegistryEvent::parse(&decoded).unwrap_err().field, "worker");
    }

    #[test]
    fn test_job_id_wider_than_u64_rejected() {
        let decoded = DecodedEvent::new(
            "JobCancelled",
            json!({ "job_id": "18446744073709551616" }),
        );
        assert!(RegistryEvent::parse(&decoded).is_err());
    }

    #[test]
    fn test_job_id_beyond_i64_rejected() {
        let decoded = DecodedEvent::new(
            "JobAssigned",
            json!({ "job_id": (1u64 << 63).to_string(), "worker": WORKER }),
        );
        let err = RegistryEvent::parse(&decoded).unwrap_err();
        assert_eq!(err.field, "job_id");

        let decoded = DecodedEvent::new(
            "ReputationUpdated",
            json!({
                "worker": WORKER,
                "old_reputation": "500",
                "new_reputation": "510",
                "reason": "bonus",
                "job_id": u64::MAX,
            }),
        );
        assert_eq!(RegistryEvent::parse(&decoded).unwrap_err().field, "job_id");

        let decoded = DecodedEvent::new(
            "JobCreated",
            json!({
                "job_id": "3",
                "creator": WORKER,
                "reward": "1000",
                "deadline": u64::MAX,
            }),
        );
        assert_eq!(RegistryEvent::parse(&decoded).unwrap_err().field, "deadline");

        let decoded = DecodedEvent::new(
            "JobCancelled",
            json!({ "job_id": i64::MAX.to_string() }),
        );
        assert_eq!(
            RegistryEvent::parse(&decoded).unwrap(),
            RegistryEvent::JobCancelled { job_id: 9_223_372_036_854_775_807 }
        );
    }

    #[test]
    fn test_reputation_optional_job_id() {
        let decoded = DecodedEvent::new(
            "ReputationUpdated",
            json!({
                "worker": WORKER,
                "old_reputation": "500",
                "new_reputation": "650",
                "reason": "job_completion",
            }),
        );
        match RegistryEvent::parse(&decoded).unwrap() {
            RegistryEvent::ReputationUpdated {
                worker,
                old_reputation,
                new_reputation,
                related_job_id,
                ..
            } => {
                assert_eq!(worker, WORKER.to_ascii_lowercase());
                assert_eq!((old_reputation, new_reputation), (500, 650));
                assert_eq!(related_job_id, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_name_passes_through() {
        let decoded = DecodedEvent::new("DisputeOpened", json!({}));
        let event = RegistryEvent::parse(&decoded).unwrap();
        assert_eq!(event.name(), "DisputeOpened");
        assert_eq!(event.hydration_target(), None);
    }

    #[test]
    fn test_empty_info_reference_is_none() {
        let decoded = DecodedEvent::new("WorkerRegistered", json!({ "worker": WORKER, "info_cid": "" }));
        assert_eq!(
            RegistryEvent::parse(&decoded).unwrap(),
            RegistryEvent::WorkerRegistered {
                worker: WORKER.to_ascii_lowercase(),
                info_reference: None,
            }
        );
    }
}
