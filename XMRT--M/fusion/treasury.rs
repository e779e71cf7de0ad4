use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Share of revenue routed to the treasury unless configured otherwise.
pub const DEFAULT_TREASURY_RATIO: f64 = 0.85;

/// Allocation failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AllocationError {
    /// Total or ratio outside the accepted domain.
    #[error("invalid allocation input: {0}")]
    InvalidInput(String),
    /// The exact-sum invariant could not be established.
    #[error("allocation invariant violated: {treasury} + {operations} != {total}")]
    InvariantViolation {
        /// Requested total.
        total: f64,
        /// Computed treasury share.
        treasury: f64,
        /// Computed operations share.
        operations: f64,
    },
}

/// Revenue split. `treasury_share + operations_share == total` exactly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AllocationResult {
    /// Amount split.
    pub total: f64,
    /// Treasury portion.
    pub treasury_share: f64,
    /// Operations portion (the remainder).
    pub operations_share: f64,
    /// Ratio requested.
    pub treasury_ratio: f64,
}

impl AllocationResult {
    /// Re-checks the invariants on a result that may have been deserialized.
    pub fn verify(&self) -> Result<(), AllocationError> {
        let shares = [self.total, self.treasury_share, self.operations_share];
        if shares.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(AllocationError::InvalidInput(format!(
                "non-finite or negative amount in {self:?}"
            )));
        }
        #[allow(clippy::float_cmp)]
        let exact = self.treasury_share + self.operations_share == self.total;
        if exact {
            Ok(())
        } else {
            Err(AllocationError::InvariantViolation {
                total: self.total,
                treasury: self.treasury_share,
                operations: self.operations_share,
            })
        }
    }

    /// Display copy with every amount rounded half away from zero to
    /// `decimals` places. The exact-sum invariant does not carry over.
    #[must_use]
    pub fn rounded(&self, decimals: u32) -> Self {
        let round = |value: f64| {
            let scale = 10_f64.powi(i32::try_from(decimals).unwrap_or(i32::MAX));
            if scale.is_finite() {
                (value * scale).round() / scale
            } else {
                value
            }
        };
        Self {
            total: round(self.total),
            treasury_share: round(self.treasury_share),
            operations_share: round(self.operations_share),
            treasury_ratio: self.treasury_ratio,
        }
    }
}

/// Splits `total` into treasury and operations shares.
///
/// The operations share is the remainder so no rounding residue is lost.
pub fn allocate(total: f64, treasury_ratio: f64) -> Result<AllocationResult, AllocationError> {
    if !total.is_finite() || total < 0.0 {
        return Err(AllocationError::InvalidInput(format!(
            "total must be a finite non-negative amount, got {total}"
        )));
    }
    if !(0.0..=1.0).contains(&treasury_ratio) {
        return Err(AllocationError::InvalidInput(format!(
            "treasury ratio must lie in [0, 1], got {treasury_ratio}"
        )));
    }

    let mut treasury = total * treasury_ratio;
    let operations = total - treasury;
    #[allow(clippy::float_cmp)]
    let residue = treasury + operations != total;
    if residue {
        // `total - operations` is exact here since operations lies in [total/2, total].
        treasury = total - operations;
    }
    let result = AllocationResult {
        total,
        treasury_share: treasury,
        operations_share: operations,
        treasury_ratio,
    };
    result.verify()?;
    Ok(result)
}
