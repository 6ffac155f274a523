//! Clock value type and the clock-type table.
//!
//! A `Clock` is immutable once constructed: frequency, expected jitter,
//! max relative frequency error, and an optional epoch tag used by the
//! clock-normalization shortcut (two clocks sharing an epoch can be related
//! without going through a `ClockPair`).

use crate::error::{MlatError, Result};

/// Epoch tag: clocks sharing the same epoch can be compared directly
/// (e.g. two GPS-disciplined radarcape receivers both count nanoseconds
/// since GPS midnight).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Epoch {
    GpsMidnight,
    None,
}

/// A receiver's sample clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clock {
    pub freq: f64,
    pub max_freq_error: f64,
    pub jitter: f64,
    pub epoch: Epoch,
}

impl Clock {
    /// Construct a clock from its type name, per the binding clock-type
    /// table. Returns an error for unrecognized types — this is one of the
    /// handful of configuration-time failures that should fail fast.
    pub fn from_type(name: &str) -> Result<Clock> {
        let clock = match name {
            "radarcape_gps" => Clock {
                freq: 1e9,
                max_freq_error: 1e-6,
                jitter: 15e-9,
                epoch: Epoch::GpsMidnight,
            },
            "beast" => Clock {
                freq: 12e6,
                max_freq_error: 5e-6,
                jitter: 83e-9,
                epoch: Epoch::None,
            },
            "sbs" => Clock {
                freq: 20e6,
                max_freq_error: 100e-6,
                jitter: 500e-9,
                epoch: Epoch::None,
            },
            "dump1090" => Clock {
                freq: 12e6,
                max_freq_error: 100e-6,
                jitter: 500e-9,
                epoch: Epoch::None,
            },
            other => return Err(MlatError::UnknownClockType(other.to_string())),
        };
        Ok(clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radarcape_gps_values() {
        let c = Clock::from_type("radarcape_gps").unwrap();
        assert_eq!(c.freq, 1e9);
        assert_eq!(c.max_freq_error, 1e-6);
        assert_eq!(c.jitter, 15e-9);
        assert_eq!(c.epoch, Epoch::GpsMidnight);
    }

    #[test]
    fn beast_values() {
        let c = Clock::from_type("beast").unwrap();
        assert_eq!(c.freq, 12e6);
        assert_eq!(c.max_freq_error, 5e-6);
        assert_eq!(c.jitter, 83e-9);
    }

    #[test]
    fn sbs_values() {
        let c = Clock::from_type("sbs").unwrap();
        assert_eq!(c.freq, 20e6);
        assert_eq!(c.max_freq_error, 100e-6);
        assert_eq!(c.jitter, 500e-9);
    }

    #[test]
    fn dump1090_values() {
        let c = Clock::from_type("dump1090").unwrap();
        assert_eq!(c.freq, 12e6);
        assert_eq!(c.max_freq_error, 100e-6);
        assert_eq!(c.jitter, 500e-9);
    }

    #[test]
    fn unknown_type_is_error() {
        assert!(Clock::from_type("nonexistent").is_err());
    }
}
