use serde::Serialize;

use crate::errors::{AppError, AppResult};
use crate::geocode::{Coordinate, GeocodeOutcome, OutcomeStatus};

/// Orders outcomes by row index.
///
/// Fails unless every index in `0..expected` appears exactly once, so a lost
/// or duplicated lookup can never shift coordinates onto the wrong row.
pub fn merge_outcomes(expected: usize, outcomes: Vec<GeocodeOutcome>) -> AppResult<Vec<GeocodeOutcome>> {
    if outcomes.len() != expected {
        return Err(AppError::Merge(format!(
            "expected {expected} outcomes, received {}",
            outcomes.len()
        )));
    }

    let mut slots: Vec<Option<GeocodeOutcome>> = vec![None; expected];
    for outcome in outcomes {
        let index = outcome.index;
        let slot = slots.get_mut(index).ok_or_else(|| {
            AppError::Merge(format!("outcome index {index} outside 0..{expected}"))
        })?;
        if slot.is_some() {
            return Err(AppError::Merge(format!("duplicate outcome for index {index}")));
        }
        *slot = Some(outcome);
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| AppError::Merge(format!("missing outcome for index {index}")))
        })
        .collect()
}

/// Both lookups for one contact row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowCoordinates {
    pub index: usize,
    pub residential: GeocodeOutcome,
    pub postal: GeocodeOutcome,
}

impl RowCoordinates {
    /// Residential and postal coordinates, present only when both resolved.
    pub fn survivor(&self) -> Option<(Coordinate, Coordinate)> {
        match (&self.residential, &self.postal) {
            (
                GeocodeOutcome {
                    status: OutcomeStatus::Resolved,
                    coordinate: Some(residential),
                    ..
                },
                GeocodeOutcome {
                    status: OutcomeStatus::Resolved,
                    coordinate: Some(postal),
                    ..
                },
            ) => Some((*residential, *postal)),
            _ => None,
        }
    }
}

/// Zips two ordered outcome sequences that share one index space.
pub fn pair_outcomes(
    residential: Vec<GeocodeOutcome>,
    postal: Vec<GeocodeOutcome>,
) -> AppResult<Vec<RowCoordinates>> {
    if residential.len() != postal.len() {
        return Err(AppError::Merge(format!(
            "residential and postal outcome counts differ ({} vs {})",
            residential.len(),
            postal.len()
        )));
    }

    residential
        .into_iter()
        .zip(postal)
        .map(|(residential, postal)| {
            if residential.index != postal.index {
                return Err(AppError::Merge(format!(
                    "outcome indices out of step ({} vs {})",
                    residential.index, postal.index
                )));
            }
            Ok(RowCoordinates {
                index: residential.index,
                residential,
                postal,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeTally {
    pub total: usize,
    pub resolved: usize,
    pub not_found: usize,
    pub failed: usize,
}

impl OutcomeTally {
    pub fn from_outcomes(outcomes: &[GeocodeOutcome]) -> Self {
        outcomes.iter().fold(
            Self {
                total: outcomes.len(),
                ..Self::default()
            },
            |mut tally, outcome| {
                match outcome.status {
                    OutcomeStatus::Resolved => tally.resolved += 1,
                    OutcomeStatus::NotFound => tally.not_found += 1,
                    OutcomeStatus::Failed => tally.failed += 1,
                }
                tally
            },
        )
    }

    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.failed == self.total
    }
}
