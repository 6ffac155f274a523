//! TDOA position solve: the bit where all the magic happens. Takes a set
//! of receive timestamps (already rescaled to a common pseudorange
//! basis) plus an optional reported altitude, and fits a transmitter
//! ECEF position by nonlinear least squares.
//!
//! The original implementation hands this straight to
//! `scipy.optimize.leastsq`. There's no off-the-shelf trust-region solver
//! in this crate's dependency stack with a trait-based problem interface
//! we can ground with confidence, so the Levenberg-Marquardt iteration is
//! written out directly: each step solves a damped linear least-squares
//! system via `lstsq` (the same normal-equations-free approach
//! `numpy.linalg.lstsq`/scipy use internally), which keeps the numerics
//! grounded in a real crate without guessing at an unfamiliar API.

use nalgebra::{DMatrix, DVector, Matrix3};

use crate::constants::{CAIR, MAX_RANGE, SOLVER_MAXFEV};
use crate::geodesy::{ecef2llh, ecef_distance, Ecef};

pub struct Measurement {
    pub receiver_position: Ecef,
    /// `(timestamp - base_timestamp) * CAIR`, metres.
    pub pseudorange: f64,
    /// `sqrt(variance) * CAIR`, metres.
    pub error: f64,
}

pub struct SolveResult {
    pub position: Ecef,
    pub covariance: Option<Matrix3<f64>>,
}

/// Parameter vector is `[x, y, z, clock_offset]`.
fn residuals(
    params: &DVector<f64>,
    measurements: &[Measurement],
    altitude: Option<f64>,
    altitude_error: f64,
) -> DVector<f64> {
    let position = (params[0], params[1], params[2]);
    let offset = params[3];
    let n = measurements.len() + if altitude.is_some() { 1 } else { 0 };
    let mut r = DVector::<f64>::zeros(n);

    for (i, m) in measurements.iter().enumerate() {
        let guess = ecef_distance(m.receiver_position, position) - offset;
        r[i] = (m.pseudorange - guess) / m.error;
    }
    if let Some(alt) = altitude {
        let (_, _, alt_guess) = ecef2llh(position);
        r[measurements.len()] = (alt - alt_guess) / altitude_error;
    }
    r
}

/// Numerical (central-difference) Jacobian of `residuals` w.r.t. params.
/// The residual function is smooth away from the receiver/target
/// coincidence singularity, so finite differencing is stable here.
fn jacobian(
    params: &DVector<f64>,
    measurements: &[Measurement],
    altitude: Option<f64>,
    altitude_error: f64,
) -> DMatrix<f64> {
    let n = measurements.len() + if altitude.is_some() { 1 } else { 0 };
    let mut j = DMatrix::<f64>::zeros(n, 4);
    let h = 1.0;
    for k in 0..4 {
        let mut p_plus = params.clone();
        let mut p_minus = params.clone();
        p_plus[k] += h;
        p_minus[k] -= h;
        let r_plus = residuals(&p_plus, measurements, altitude, altitude_error);
        let r_minus = residuals(&p_minus, measurements, altitude, altitude_error);
        for i in 0..n {
            j[(i, k)] = (r_plus[i] - r_minus[i]) / (2.0 * h);
        }
    }
    j
}

fn lm_step(jac: &DMatrix<f64>, res: &DVector<f64>, lambda: f64) -> Option<DVector<f64>> {
    let (m, n) = (jac.nrows(), jac.ncols());
    let mut a = DMatrix::<f64>::zeros(m + n, n);
    a.view_mut((0, 0), (m, n)).copy_from(jac);
    for i in 0..n {
        a[(m + i, i)] = lambda.sqrt();
    }
    let mut b = DVector::<f64>::zeros(m + n);
    b.view_mut((0, 0), (m, 1)).copy_from(res);

    lstsq::lstsq(&a, &b, 1e-12).ok().map(|r| r.solution)
}

/// Fit a transmitter ECEF position given `measurements` (receiver
/// position, pseudorange, pseudorange error) and an optional altitude
/// pseudo-measurement. `initial_guess` seeds the solve (e.g. the
/// centroid of the contributing receivers).
pub fn solve(
    measurements: &[Measurement],
    altitude: Option<f64>,
    altitude_error: f64,
    initial_guess: Ecef,
) -> Option<SolveResult> {
    let dof_count = measurements.len() + if altitude.is_some() { 1 } else { 0 };
    if dof_count < 4 {
        return None;
    }

    let mut params = DVector::from_vec(vec![
        initial_guess.0,
        initial_guess.1,
        initial_guess.2,
        0.0,
    ]);
    let mut lambda = 1e-3;
    let mut r = residuals(&params, measurements, altitude, altitude_error);
    let mut cost = r.norm_squared();

    for _ in 0..SOLVER_MAXFEV {
        let jac = jacobian(&params, measurements, altitude, altitude_error);
        let Some(step) = lm_step(&jac, &r, lambda) else {
            return None;
        };

        let trial = &params - &step;
        let trial_r = residuals(&trial, measurements, altitude, altitude_error);
        let trial_cost = trial_r.norm_squared();

        if trial_cost < cost {
            let improved = cost - trial_cost;
            params = trial;
            r = trial_r;
            cost = trial_cost;
            lambda = (lambda / 3.0).max(1e-12);
            if improved < 1e-10 {
                break;
            }
        } else {
            lambda *= 4.0;
            if lambda > 1e12 {
                break;
            }
        }
    }

    let offset_est = params[3];
    if offset_est < 0.0 || offset_est > MAX_RANGE {
        return None;
    }

    let position = (params[0], params[1], params[2]);
    for m in measurements {
        if ecef_distance(m.receiver_position, position) > MAX_RANGE {
            return None;
        }
    }

    let jac = jacobian(&params, measurements, altitude, altitude_error);
    let jtj = jac.transpose() * &jac;
    let covariance = jtj.try_inverse().map(|inv| {
        let residual_variance = if dof_count > 4 {
            cost / (dof_count as f64 - 4.0)
        } else {
            1.0
        };
        let full = inv * residual_variance;
        Matrix3::new(
            full[(0, 0)],
            full[(0, 1)],
            full[(0, 2)],
            full[(1, 0)],
            full[(1, 1)],
            full[(1, 2)],
            full[(2, 0)],
            full[(2, 1)],
            full[(2, 2)],
        )
    });

    Some(SolveResult { position, covariance })
}

/// Convenience for `mlattrack`: build the pseudorange measurement list
/// for a cluster of `(receiver_position, timestamp, variance)` entries
/// sharing a common timebase, relative to the earliest timestamp.
pub fn build_measurements(entries: &[(Ecef, f64, f64)]) -> Vec<Measurement> {
    let Some(&(_, base_timestamp, _)) = entries.first() else {
        return Vec::new();
    };
    entries
        .iter()
        .map(|&(receiver_position, timestamp, variance)| Measurement {
            receiver_position,
            pseudorange: (timestamp - base_timestamp) * CAIR,
            error: variance.sqrt() * CAIR,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodesy::llh2ecef;

    #[test]
    fn solves_known_position_from_noiseless_ranges() {
        let target = llh2ecef((52.0, 4.0, 3000.0));
        let receivers = [
            llh2ecef((51.9, 3.9, 0.0)),
            llh2ecef((52.1, 3.9, 0.0)),
            llh2ecef((52.0, 4.2, 0.0)),
            llh2ecef((51.95, 4.15, 0.0)),
        ];

        let entries: Vec<(Ecef, f64, f64)> = receivers
            .iter()
            .map(|&r| {
                let range = ecef_distance(r, target);
                (r, range / CAIR, 1e-12)
            })
            .collect();
        let measurements = build_measurements(&entries);

        let initial_guess = llh2ecef((52.0, 4.0, 0.0));
        let result = solve(&measurements, None, 100.0, initial_guess).expect("solve should succeed");

        assert!(ecef_distance(result.position, target) < 50.0);
    }

    #[test]
    fn too_few_measurements_is_refused() {
        let entries = vec![
            (llh2ecef((51.9, 3.9, 0.0)), 0.0, 1e-12),
            (llh2ecef((52.1, 3.9, 0.0)), 0.001, 1e-12),
        ];
        let measurements = build_measurements(&entries);
        let result = solve(&measurements, None, 100.0, llh2ecef((52.0, 4.0, 0.0)));
        assert!(result.is_none());
    }
}
