//! Per-field interpolation rates.

use rustc_hash::FxHashMap;

use crate::engine::SyncError;

/// Fields that converge over several ticks instead of snapping, with the
/// fraction of the remaining distance covered each tick.
#[derive(Debug, Clone, Default)]
pub struct LerpTable {
    rates: FxHashMap<String, f64>,
    default_rate: Option<f64>,
}

fn check_rate(field: &str, rate: f64) -> Result<f64, SyncError> {
    if rate.is_finite() && rate > 0.0 && rate <= 1.0 {
        Ok(rate)
    } else {
        Err(SyncError::InvalidLerpRate {
            field: field.to_string(),
            rate,
        })
    }
}

impl LerpTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table whose [`register_default`](Self::register_default) falls back
    /// to `rate`.
    pub fn with_default_rate(rate: f64) -> Result<Self, SyncError> {
        Ok(Self {
            rates: FxHashMap::default(),
            default_rate: Some(check_rate("<default>", rate)?),
        })
    }

    /// Interpolate `field` at `rate` per tick. Rates must lie in `(0, 1]`.
    pub fn register(&mut self, field: impl Into<String>, rate: f64) -> Result<(), SyncError> {
        let field = field.into();
        let rate = check_rate(&field, rate)?;
        tracing::debug!("Lerp registered: {field} @ {rate}");
        self.rates.insert(field, rate);
        Ok(())
    }

    /// Interpolate `field` at the table's default rate.
    pub fn register_default(&mut self, field: impl Into<String>) -> Result<(), SyncError> {
        let field = field.into();
        let rate = self.default_rate.ok_or_else(|| SyncError::InvalidLerpRate {
            field: field.clone(),
            rate: f64::NAN,
        })?;
        self.register(field, rate)
    }

    pub fn unregister(&mut self, field: &str) -> Option<f64> {
        self.rates.remove(field)
    }

    pub fn rate_for(&self, field: &str) -> Option<f64> {
        self.rates.get(field).copied()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}
