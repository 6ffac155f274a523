//! Per-aircraft Kalman filter: constant-velocity or constant-acceleration
//! state, driven by pseudorange-difference + altitude observations.
//!
//! The reference design calls for an unscented Kalman filter; this
//! implementation uses an extended Kalman filter instead. That
//! substitution is explicitly sanctioned for airborne geometries, where
//! the pseudorange observation's non-linearity is well approximated by a
//! first-order (Jacobian) expansion around the current state estimate.
//! `adskalman`-style fixed-dimension observation models don't fit here —
//! the observation dimension changes with the number of contributing
//! receivers on every resolve — so the correction step is written by hand
//! against `nalgebra`'s dynamically-sized matrices, while the constant
//! state dimension (6 for CV, 9 for CA) still uses fixed-size algebra for
//! the predict step.

use nalgebra::{DMatrix, DVector, Matrix3, Matrix6, SMatrix, Vector3, Vector6};

use crate::geodesy::{ecef2llh, Ecef};

const OUTLIER_MAHALANOBIS_DISTANCE: f64 = 15.0;
const OUTLIER_RESET_COUNT: u32 = 3;
const OUTLIER_RESET_GAP_S: f64 = 15.0;
const MIN_ACQUIRING_DOF: i32 = 1;
const MIN_ACQUIRING_POSITION_ERROR: f64 = 3e3;
const MIN_ACQUIRING_VELOCITY_ERROR: f64 = 50.0;
const MAX_TRACKING_POSITION_ERROR: f64 = 5e3;
const MAX_TRACKING_VELOCITY_ERROR: f64 = 75.0;
const PROCESS_NOISE: f64 = 0.10;

/// A pseudorange observation plus the receiver geometry and error model
/// needed to linearize and weigh it.
pub struct KalmanObservation<'a> {
    pub receiver_positions: &'a [Ecef],
    /// Pseudorange measurement per receiver (already on a common
    /// timescale, scaled by `Cair`), relative to nothing yet — the first
    /// entry is subtracted inside `update`.
    pub pseudoranges: &'a [f64],
    pub variance: f64,
    pub altitude_m: Option<f64>,
    pub altitude_error_m: f64,
    pub now: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KalmanStatus {
    Acquiring,
    Tracking,
}

enum Model {
    /// 6-D state: position (m), velocity (m/s).
    Cv { state: Vector6<f64>, cov: Matrix6<f64> },
    /// 9-D state: position, velocity, acceleration (m/s^2).
    Ca {
        state: SMatrix<f64, 9, 1>,
        cov: SMatrix<f64, 9, 9>,
    },
}

pub struct Kalman {
    model: Model,
    status: KalmanStatus,
    valid: bool,
    outliers: u32,
    last_update_time: Option<f64>,
}

pub struct DerivedState {
    pub position_ecef: Ecef,
    pub velocity_ecef: (f64, f64, f64),
    pub position_llh: (f64, f64, f64),
    pub heading_deg: f64,
    pub ground_speed_ms: f64,
    pub vertical_speed_ms: f64,
    pub position_error_m: f64,
    pub velocity_error_m: f64,
}

impl Kalman {
    pub fn new_cv() -> Kalman {
        Kalman {
            model: Model::Cv {
                state: Vector6::zeros(),
                cov: Matrix6::identity() * 1e12,
            },
            status: KalmanStatus::Acquiring,
            valid: false,
            outliers: 0,
            last_update_time: None,
        }
    }

    pub fn new_ca() -> Kalman {
        Kalman {
            model: Model::Ca {
                state: SMatrix::<f64, 9, 1>::zeros(),
                cov: SMatrix::<f64, 9, 9>::identity() * 1e12,
            },
            status: KalmanStatus::Acquiring,
            valid: false,
            outliers: 0,
            last_update_time: None,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn status(&self) -> KalmanStatus {
        self.status
    }

    fn state_dim(&self) -> usize {
        match &self.model {
            Model::Cv { .. } => 6,
            Model::Ca { .. } => 9,
        }
    }

    fn position(&self) -> Vector3<f64> {
        match &self.model {
            Model::Cv { state, .. } => Vector3::new(state[0], state[1], state[2]),
            Model::Ca { state, .. } => Vector3::new(state[0], state[1], state[2]),
        }
    }

    fn velocity(&self) -> Vector3<f64> {
        match &self.model {
            Model::Cv { state, .. } => Vector3::new(state[3], state[4], state[5]),
            Model::Ca { state, .. } => Vector3::new(state[3], state[4], state[5]),
        }
    }

    fn position_covariance(&self) -> Matrix3<f64> {
        match &self.model {
            Model::Cv { cov, .. } => cov.fixed_view::<3, 3>(0, 0).into(),
            Model::Ca { cov, .. } => cov.fixed_view::<3, 3>(0, 0).into(),
        }
    }

    fn velocity_covariance(&self) -> Matrix3<f64> {
        match &self.model {
            Model::Cv { cov, .. } => cov.fixed_view::<3, 3>(3, 3).into(),
            Model::Ca { cov, .. } => cov.fixed_view::<3, 3>(3, 3).into(),
        }
    }

    fn position_error(&self) -> f64 {
        self.position_covariance().trace().max(0.0).sqrt()
    }

    fn velocity_error(&self) -> f64 {
        self.velocity_covariance().trace().max(0.0).sqrt()
    }

    /// Predict the state `dt` seconds forward under the configured
    /// transition model (constant velocity/acceleration) and inflate the
    /// covariance by the process noise. Fixed-size linear algebra since
    /// the state dimension is compile-time constant.
    fn predict(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        match &mut self.model {
            Model::Cv { state, cov } => {
                let mut f = Matrix6::identity();
                for i in 0..3 {
                    f[(i, i + 3)] = dt;
                }
                *state = f * *state;

                let q = cv_process_noise(dt, PROCESS_NOISE);
                *cov = f * *cov * f.transpose() + q;
            }
            Model::Ca { state, cov } => {
                let mut f = SMatrix::<f64, 9, 9>::identity();
                for i in 0..3 {
                    f[(i, i + 3)] = dt;
                    f[(i, i + 6)] = 0.5 * dt * dt;
                    f[(i + 3, i + 6)] = dt;
                }
                *state = f * *state;

                let q = ca_process_noise(dt, PROCESS_NOISE);
                *cov = f * *cov * f.transpose() + q;
            }
        }
    }

    /// Linearized observation: pseudorange differences relative to the
    /// first receiver, optionally followed by an altitude pseudo-row.
    /// Returns `(predicted_observation, jacobian)`.
    fn observation_model(&self, obs: &KalmanObservation) -> (DVector<f64>, DMatrix<f64>) {
        let position = self.position();
        let n = obs.receiver_positions.len();
        let has_altitude = obs.altitude_m.is_some();
        let rows = (n - 1) + if has_altitude { 1 } else { 0 };
        let sd = self.state_dim();

        let mut predicted = DVector::<f64>::zeros(rows);
        let mut jac = DMatrix::<f64>::zeros(rows, sd);

        let range = |p: &Vector3<f64>| -> f64 {
            (position - p).norm()
        };
        let range_gradient = |p: &Vector3<f64>| -> Vector3<f64> {
            let d = position - p;
            let n = d.norm();
            if n < 1e-6 {
                Vector3::zeros()
            } else {
                d / n
            }
        };

        let r0 = Vector3::new(
            obs.receiver_positions[0].0,
            obs.receiver_positions[0].1,
            obs.receiver_positions[0].2,
        );
        let range0 = range(&r0);
        let grad0 = range_gradient(&r0);

        for i in 1..n {
            let ri = Vector3::new(
                obs.receiver_positions[i].0,
                obs.receiver_positions[i].1,
                obs.receiver_positions[i].2,
            );
            let range_i = range(&ri);
            let grad_i = range_gradient(&ri);

            predicted[i - 1] = range_i - range0;
            for k in 0..3 {
                jac[(i - 1, k)] = grad_i[k] - grad0[k];
            }
        }

        if has_altitude {
            let (_, _, alt) = ecef2llh((position.x, position.y, position.z));
            predicted[rows - 1] = alt;
            // Gradient of height w.r.t. ECEF position is well approximated
            // by the local "up" unit vector for the altitudes this system
            // operates at.
            let up = position.normalize();
            for k in 0..3 {
                jac[(rows - 1, k)] = up[k];
            }
        }

        (predicted, jac)
    }

    fn observation_covariance(&self, obs: &KalmanObservation, rows: usize) -> DMatrix<f64> {
        let mut r = DMatrix::<f64>::zeros(rows, rows);
        let pr_var = obs.variance * crate::constants::CAIR * crate::constants::CAIR;
        let has_altitude = obs.altitude_m.is_some();
        let pr_rows = if has_altitude { rows - 1 } else { rows };
        for i in 0..pr_rows {
            r[(i, i)] = pr_var;
        }
        if has_altitude {
            r[(rows - 1, rows - 1)] = obs.altitude_error_m * obs.altitude_error_m;
        }
        r
    }

    /// Attempt an update. Returns `true` if the observation was accepted
    /// (passed the Mahalanobis gate, or no gate applied yet because the
    /// filter is still acquiring with no prior estimate).
    pub fn update(&mut self, dof: i32, obs: &KalmanObservation) -> bool {
        if dof < MIN_ACQUIRING_DOF {
            self.valid = false;
            return false;
        }

        if let Some(last) = self.last_update_time {
            self.predict(obs.now - last);
        }

        let n = obs.receiver_positions.len();
        let has_altitude = obs.altitude_m.is_some();
        let rows = (n - 1) + if has_altitude { 1 } else { 0 };

        let mut measurement = DVector::<f64>::zeros(rows);
        let pr_rows = if has_altitude { rows - 1 } else { rows };
        for i in 0..pr_rows {
            measurement[i] = obs.pseudoranges[i + 1] - obs.pseudoranges[0];
        }
        if let Some(alt) = obs.altitude_m {
            measurement[rows - 1] = alt;
        }

        let (predicted, h) = self.observation_model(obs);
        let r = self.observation_covariance(obs, rows);
        let innovation = &measurement - &predicted;

        let sd = self.state_dim();
        let p = self.covariance_dynamic();
        let s = &h * &p * h.transpose() + &r;

        let Some(s_inv) = s.clone().try_inverse() else {
            return false;
        };

        let mahalanobis_sq = (innovation.transpose() * &s_inv * &innovation)[(0, 0)];

        let first_observation = self.last_update_time.is_none();
        if !first_observation && mahalanobis_sq > OUTLIER_MAHALANOBIS_DISTANCE * OUTLIER_MAHALANOBIS_DISTANCE {
            self.outliers += 1;
            let stale = self
                .last_update_time
                .map(|t| obs.now - t >= OUTLIER_RESET_GAP_S)
                .unwrap_or(false);
            if self.outliers >= OUTLIER_RESET_COUNT || stale {
                self.reset();
            }
            return false;
        }

        let k = &p * h.transpose() * &s_inv;
        let state_update = &k * &innovation;
        let new_cov = (DMatrix::<f64>::identity(sd, sd) - &k * &h) * &p;

        self.apply_dynamic_update(&state_update, &new_cov);
        self.outliers = 0;
        self.last_update_time = Some(obs.now);

        let pos_err = self.position_error();
        let vel_err = self.velocity_error();
        match self.status {
            KalmanStatus::Acquiring => {
                if pos_err < MIN_ACQUIRING_POSITION_ERROR && vel_err < MIN_ACQUIRING_VELOCITY_ERROR {
                    self.status = KalmanStatus::Tracking;
                }
            }
            KalmanStatus::Tracking => {
                if pos_err > MAX_TRACKING_POSITION_ERROR || vel_err > MAX_TRACKING_VELOCITY_ERROR {
                    self.status = KalmanStatus::Acquiring;
                }
            }
        }
        self.valid = true;
        true
    }

    fn covariance_dynamic(&self) -> DMatrix<f64> {
        match &self.model {
            Model::Cv { cov, .. } => DMatrix::from_iterator(6, 6, cov.iter().copied()),
            Model::Ca { cov, .. } => DMatrix::from_iterator(9, 9, cov.iter().copied()),
        }
    }

    fn apply_dynamic_update(&mut self, state_update: &DVector<f64>, new_cov: &DMatrix<f64>) {
        match &mut self.model {
            Model::Cv { state, cov } => {
                for i in 0..6 {
                    state[i] += state_update[i];
                    for j in 0..6 {
                        cov[(i, j)] = new_cov[(i, j)];
                    }
                }
            }
            Model::Ca { state, cov } => {
                for i in 0..9 {
                    state[i] += state_update[i];
                    for j in 0..9 {
                        cov[(i, j)] = new_cov[(i, j)];
                    }
                }
            }
        }
    }

    /// Force a full reset: clear the state estimate and mark invalid, as
    /// if newly acquiring. Triggered by 3 consecutive Mahalanobis
    /// outliers, or a single outlier 15s or more after the last accepted
    /// update.
    pub fn reset(&mut self) {
        match &mut self.model {
            Model::Cv { state, cov } => {
                *state = Vector6::zeros();
                *cov = Matrix6::identity() * 1e12;
            }
            Model::Ca { state, cov } => {
                *state = SMatrix::<f64, 9, 1>::zeros();
                *cov = SMatrix::<f64, 9, 9>::identity() * 1e12;
            }
        }
        self.status = KalmanStatus::Acquiring;
        self.valid = false;
        self.outliers = 0;
        self.last_update_time = None;
    }

    pub fn derived(&self) -> DerivedState {
        let pos = self.position();
        let vel = self.velocity();
        let position_ecef = (pos.x, pos.y, pos.z);
        let llh = ecef2llh(position_ecef);
        let (lat_r, lon_r, _) = (llh.0.to_radians(), llh.1.to_radians(), llh.2);

        // Standard ECEF -> ENU rotation, parameterised by lat/lon.
        let (sin_lat, cos_lat) = lat_r.sin_cos();
        let (sin_lon, cos_lon) = lon_r.sin_cos();

        let east = -sin_lon * vel.x + cos_lon * vel.y;
        let north = -sin_lat * cos_lon * vel.x - sin_lat * sin_lon * vel.y + cos_lat * vel.z;
        let up = cos_lat * cos_lon * vel.x + cos_lat * sin_lon * vel.y + sin_lat * vel.z;

        let heading_deg = east.atan2(north).to_degrees().rem_euclid(360.0);
        let ground_speed_ms = (east * east + north * north).sqrt();

        DerivedState {
            position_ecef,
            velocity_ecef: (vel.x, vel.y, vel.z),
            position_llh: llh,
            heading_deg,
            ground_speed_ms,
            vertical_speed_ms: up,
            position_error_m: self.position_error(),
            velocity_error_m: self.velocity_error(),
        }
    }
}

fn cv_process_noise(dt: f64, q: f64) -> Matrix6<f64> {
    let q2 = q * q;
    let mut m = Matrix6::zeros();
    let dt2 = dt * dt;
    let dt3 = dt2 * dt;
    let dt4 = dt3 * dt;
    for i in 0..3 {
        m[(i, i)] = 0.25 * dt4 * q2;
        m[(i, i + 3)] = 0.5 * dt3 * q2;
        m[(i + 3, i)] = 0.5 * dt3 * q2;
        m[(i + 3, i + 3)] = dt2 * q2;
    }
    m
}

fn ca_process_noise(dt: f64, q: f64) -> SMatrix<f64, 9, 9> {
    let q2 = q * q;
    let mut m = SMatrix::<f64, 9, 9>::zeros();
    let dt2 = dt * dt;
    let dt3 = dt2 * dt;
    let dt4 = dt3 * dt;
    let dt5 = dt4 * dt;
    for i in 0..3 {
        m[(i, i)] = dt5 / 20.0 * q2;
        m[(i, i + 3)] = dt4 / 8.0 * q2;
        m[(i + 3, i)] = dt4 / 8.0 * q2;
        m[(i, i + 6)] = dt3 / 6.0 * q2;
        m[(i + 6, i)] = dt3 / 6.0 * q2;
        m[(i + 3, i + 3)] = dt3 / 3.0 * q2;
        m[(i + 3, i + 6)] = dt2 / 2.0 * q2;
        m[(i + 6, i + 3)] = dt2 / 2.0 * q2;
        m[(i + 6, i + 6)] = dt * q2;
    }
    m
}
