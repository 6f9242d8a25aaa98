//! Weighted federated averaging (FedAvg).
//!
//! Pure: no I/O, no shared state. The caller supplies the last published version.

use super::error::AggregationError;
use super::types::{Model, ModelVersion, UpdateRecord};

/// Sample-weighted mean of all update payloads, component-wise, producing `previous_version + 1`.
pub fn aggregate(updates: &[UpdateRecord], previous_version: ModelVersion) -> Result<Model, AggregationError> {
    let first = updates.first().ok_or(AggregationError::EmptyInput)?;
    let dim = first.payload.w.len();
    if let Some(bad) = updates.iter().find(|u| u.payload.w.len() != dim) {
        return Err(AggregationError::SchemaMismatch { participant_id: bad.participant_id.clone(), expected: dim, found: bad.payload.w.len() });
    }
    let total_samples: u128 = updates.iter().map(|u| u.num_samples as u128).sum();
    if total_samples == 0 { return Err(AggregationError::DegenerateWeights); }
    let total = total_samples as f64;

    let mut w = vec![0f64; dim];
    let mut b = 0f64;
    for u in updates {
        let n = u.num_samples as f64;
        for (acc, v) in w.iter_mut().zip(&u.payload.w) { *acc += v * n; }
        b += u.payload.b * n;
    }
    for v in &mut w { *v /= total; }
    b /= total;

    Ok(Model { w, b, version: previous_version + 1 })
}

/// Sum of declared samples, used for completion notices.
pub fn total_samples(updates: &[UpdateRecord]) -> u64 {
    updates.iter().fold(0u64, |acc, u| acc.saturating_add(u.num_samples))
}
