//! Structural validation of inbound bus payloads.
//!
//! Everything here is side-effect free: a rejected record never reaches the registry.

use super::error::RoundError;
use super::types::{RoundStart, UpdateRecord};

fn malformed(msg: impl Into<String>) -> RoundError { RoundError::MalformedRecord(msg.into()) }

/// Identifiers end up as single subject tokens, so they must not contain separators or wildcards.
pub fn check_token(field: &str, value: &str) -> Result<(), RoundError> {
    if value.is_empty() { return Err(malformed(format!("{field} is empty"))); }
    if value.chars().any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace()) {
        return Err(malformed(format!("{field} '{value}' is not a single subject token")));
    }
    Ok(())
}

pub fn validate_update(rec: &UpdateRecord) -> Result<(), RoundError> {
    check_token("round_id", &rec.round_id)?;
    check_token("participant_id", &rec.participant_id)?;
    if rec.payload.w.is_empty() { return Err(malformed("update.w is empty")); }
    if let Some(i) = rec.payload.w.iter().position(|v| !v.is_finite()) {
        return Err(malformed(format!("update.w[{i}] is not finite")));
    }
    if !rec.payload.b.is_finite() { return Err(malformed("update.b is not finite")); }
    Ok(())
}

pub fn parse_update(bytes: &[u8]) -> Result<UpdateRecord, RoundError> {
    let rec: UpdateRecord = serde_json::from_slice(bytes).map_err(|e| malformed(format!("update: {e}")))?;
    validate_update(&rec)?;
    Ok(rec)
}

/// Cross-checks the identity encoded in the subject against the payload.
pub fn check_update_origin(rec: &UpdateRecord, round_id: &str, participant_id: &str) -> Result<(), RoundError> {
    if rec.round_id != round_id || rec.participant_id != participant_id {
        return Err(malformed(format!(
            "subject names {round_id}/{participant_id} but payload names {}/{}",
            rec.round_id, rec.participant_id
        )));
    }
    Ok(())
}

pub fn validate_round_start(start: &RoundStart) -> Result<(), RoundError> {
    check_token("round_id", &start.round_id)?;
    if start.k_of_n == Some(0) { return Err(malformed("k_of_n must be positive")); }
    if start.timeout_s == Some(0) { return Err(malformed("timeout_s must be positive")); }
    Ok(())
}

pub fn parse_round_start(bytes: &[u8]) -> Result<RoundStart, RoundError> {
    let start: RoundStart = serde_json::from_slice(bytes).map_err(|e| malformed(format!("round start: {e}")))?;
    validate_round_start(&start)?;
    Ok(start)
}
