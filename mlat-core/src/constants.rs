//! Binding constants shared across the engine.
//!
//! Values are pinned by the interface contract; implementations must
//! reproduce them exactly for cross-server determinism (partitioning,
//! pseudorange geometry).

/// Speed of light in air, m/s (`c / 1.0003`).
pub const CAIR: f64 = 299_792_458.0 / 1.0003;

/// Feet to metres.
pub const FTOM: f64 = 0.3038;

/// Metres to feet.
pub const MTOF: f64 = 1.0 / FTOM;

/// Metres/second to knots.
pub const MS_TO_KTS: f64 = 1.9438;

/// Metres/second to feet/minute.
pub const MS_TO_FPM: f64 = MTOF * 60.0;

/// Maximum plausible receiver-to-target range, metres.
pub const MAX_RANGE: f64 = 500_000.0;

/// Maximum plausible distance between two positions of the same sync
/// message pair, metres.
pub const MAX_INTERMESSAGE_RANGE: f64 = 10_000.0;

/// Minimum Navigation Uncertainty Category accepted for clock sync.
pub const MIN_NUC: u8 = 6;

/// Seconds from first copy of an MLAT message to resolve.
pub const MLAT_DELAY: f64 = 2.5;

/// Maximum function evaluations for the TDOA solver.
pub const SOLVER_MAXFEV: usize = 50;

/// Maximum plausible altitude, metres (50,000 ft).
pub const MAX_ALT: f64 = 50_000.0 * FTOM;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cair_matches_known_value() {
        assert!((CAIR - 299_702_547.236).abs() < 1e-2);
    }

    #[test]
    fn ftom_mtof_are_inverses() {
        assert!((FTOM * MTOF - 1.0).abs() < 1e-12);
    }
}
