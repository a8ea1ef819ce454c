//! Motion models for the planar EKF
//!
//! State layout: [x, y, theta, v, w]. Each model supplies the transition
//! function, its Jacobian, and how (v, w) random-walk noise enters the state.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::Debug;

use crate::error::{NavError, NavResult};
use crate::types::{
    wrap_angle, NoiseInput, NoiseMat, StateMat, StateVec, IDX_THETA, IDX_V, IDX_W, IDX_X, IDX_Y,
};

pub trait MotionModel: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Advance the state by `dt` seconds
    fn transition(&self, x: &StateVec, dt: f64) -> StateVec;

    /// ∂f/∂x evaluated at `x`
    fn jacobian(&self, x: &StateVec, dt: f64) -> StateMat;

    /// Whether angular velocity is part of the estimated state
    fn tracks_angular_velocity(&self) -> bool {
        true
    }

    /// Mapping of the (v, w) noise increments into the state
    ///
    /// Noise is applied to v and w at the start of the interval, so the
    /// mapping is the Jacobian's velocity columns.
    fn noise_input(&self, x: &StateVec, dt: f64) -> NoiseInput {
        self.jacobian(x, dt).fixed_columns::<2>(IDX_V).into_owned()
    }

    /// Q = B · diag(σ_v²·dt, σ_w²·dt) · Bᵀ
    fn process_noise(&self, x: &StateVec, dt: f64, sigma_v: f64, sigma_w: f64) -> StateMat {
        let b = self.noise_input(x, dt);
        let n = NoiseMat::from_diagonal(&nalgebra::Vector2::new(
            sigma_v * sigma_v * dt,
            sigma_w * sigma_w * dt,
        ));
        b * n * b.transpose()
    }
}

/// Constant-velocity unicycle with midpoint heading integration
///
/// `dtheta` is the heading change over the step. The models differ only in
/// that term and in how `w` evolves.
fn unicycle(x: &StateVec, dt: f64, dtheta: f64) -> StateVec {
    let theta_m = x[IDX_THETA] + dtheta / 2.0;
    let mut next = *x;
    next[IDX_X] += x[IDX_V] * dt * theta_m.cos();
    next[IDX_Y] += x[IDX_V] * dt * theta_m.sin();
    next[IDX_THETA] = wrap_angle(x[IDX_THETA] + dtheta);
    next
}

fn unicycle_jacobian(x: &StateVec, dt: f64, dtheta: f64, d_dtheta_dw: f64) -> StateMat {
    let theta_m = x[IDX_THETA] + dtheta / 2.0;
    let v = x[IDX_V];
    let (s, c) = theta_m.sin_cos();

    let mut f = StateMat::identity();
    f[(IDX_X, IDX_THETA)] = -v * dt * s;
    f[(IDX_X, IDX_V)] = dt * c;
    f[(IDX_X, IDX_W)] = -v * dt * s * d_dtheta_dw / 2.0;
    f[(IDX_Y, IDX_THETA)] = v * dt * c;
    f[(IDX_Y, IDX_V)] = dt * s;
    f[(IDX_Y, IDX_W)] = v * dt * c * d_dtheta_dw / 2.0;
    f[(IDX_THETA, IDX_W)] = d_dtheta_dw;
    f
}

// ─── Standard ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default)]
pub struct StandardModel;

impl MotionModel for StandardModel {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn transition(&self, x: &StateVec, dt: f64) -> StateVec {
        unicycle(x, dt, x[IDX_W] * dt)
    }

    fn jacobian(&self, x: &StateVec, dt: f64) -> StateMat {
        unicycle_jacobian(x, dt, x[IDX_W] * dt, dt)
    }
}

// ─── ZeroGyro ────────────────────────────────────────────────────────────────

/// Angular velocity is not tracked; heading drifts as a random walk and is
/// pulled in only through position updates.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZeroGyroModel;

impl MotionModel for ZeroGyroModel {
    fn name(&self) -> &'static str {
        "zero_gyro"
    }

    fn tracks_angular_velocity(&self) -> bool {
        false
    }

    fn transition(&self, x: &StateVec, dt: f64) -> StateVec {
        let mut next = unicycle(x, dt, 0.0);
        next[IDX_W] = 0.0;
        next
    }

    fn jacobian(&self, x: &StateVec, dt: f64) -> StateMat {
        let mut f = unicycle_jacobian(x, dt, 0.0, 0.0);
        f[(IDX_W, IDX_W)] = 0.0;
        f
    }

    // (v, theta) random walk instead of (v, w)
    fn noise_input(&self, x: &StateVec, dt: f64) -> NoiseInput {
        let f = self.jacobian(x, dt);
        let mut b = NoiseInput::zeros();
        b.set_column(0, &f.column(IDX_V));
        b[(IDX_THETA, 1)] = 1.0;
        b
    }
}

// ─── HyperTan ────────────────────────────────────────────────────────────────

/// Effective turn rate saturates at `max_turn_rate` via tanh
#[derive(Clone, Copy, Debug)]
pub struct HyperTanModel {
    pub max_turn_rate: f64,
}

impl HyperTanModel {
    pub fn new(max_turn_rate: f64) -> Self {
        Self { max_turn_rate }
    }

    fn effective(&self, w: f64) -> (f64, f64) {
        let t = (w / self.max_turn_rate).tanh();
        (self.max_turn_rate * t, 1.0 - t * t)
    }
}

impl MotionModel for HyperTanModel {
    fn name(&self) -> &'static str {
        "hyper_tan"
    }

    fn transition(&self, x: &StateVec, dt: f64) -> StateVec {
        let (w_eff, _) = self.effective(x[IDX_W]);
        unicycle(x, dt, w_eff * dt)
    }

    fn jacobian(&self, x: &StateVec, dt: f64) -> StateMat {
        let (w_eff, dw_eff) = self.effective(x[IDX_W]);
        unicycle_jacobian(x, dt, w_eff * dt, dw_eff * dt)
    }
}

// ─── SinTrack ────────────────────────────────────────────────────────────────

/// Turn rate follows w·cos(Ω·τ) within each step, Ω = 2π·frequency
///
/// Heading change over a step is w·sin(Ω·dt)/Ω and the carried turn rate
/// becomes w·cos(Ω·dt), so sustained turning relaxes back toward straight
/// motion at the expected oscillation frequency.
#[derive(Clone, Copy, Debug)]
pub struct SinTrackModel {
    /// Oscillation frequency [Hz]
    pub frequency: f64,
}

impl SinTrackModel {
    pub fn new(frequency: f64) -> Self {
        Self { frequency }
    }

    /// Ω [rad/s]
    pub fn omega(&self) -> f64 {
        2.0 * PI * self.frequency
    }

    fn terms(&self, dt: f64) -> (f64, f64) {
        let omega = self.omega();
        if omega.abs() < 1e-9 {
            (dt, 1.0)
        } else {
            ((omega * dt).sin() / omega, (omega * dt).cos())
        }
    }
}

impl MotionModel for SinTrackModel {
    fn name(&self) -> &'static str {
        "sin_track"
    }

    fn transition(&self, x: &StateVec, dt: f64) -> StateVec {
        let (gain, decay) = self.terms(dt);
        let mut next = unicycle(x, dt, x[IDX_W] * gain);
        next[IDX_W] = x[IDX_W] * decay;
        next
    }

    fn jacobian(&self, x: &StateVec, dt: f64) -> StateMat {
        let (gain, decay) = self.terms(dt);
        let mut f = unicycle_jacobian(x, dt, x[IDX_W] * gain, gain);
        f[(IDX_W, IDX_W)] = decay;
        f
    }
}

// ─── Selection ───────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MotionModelKind {
    #[default]
    Standard,
    ZeroGyro,
    HyperTan { max_turn_rate: f64 },
    SinTrack { frequency: f64 },
}

impl MotionModelKind {
    /// Reject parameters that make the transition non-finite
    pub fn validate(&self) -> NavResult<()> {
        match *self {
            MotionModelKind::HyperTan { max_turn_rate } if !(max_turn_rate.is_finite() && max_turn_rate > 0.0) => {
                Err(NavError::InvalidConfig(format!(
                    "hyper_tan max_turn_rate {} must be positive",
                    max_turn_rate
                )))
            }
            MotionModelKind::SinTrack { frequency } if !(frequency.is_finite() && frequency >= 0.0) => {
                Err(NavError::InvalidConfig(format!(
                    "sin_track frequency {} must be finite and non-negative",
                    frequency
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn build(&self) -> NavResult<Box<dyn MotionModel>> {
        self.validate()?;
        Ok(match *self {
            MotionModelKind::Standard => Box::new(StandardModel),
            MotionModelKind::ZeroGyro => Box::new(ZeroGyroModel),
            MotionModelKind::HyperTan { max_turn_rate } => Box::new(HyperTanModel::new(max_turn_rate)),
            MotionModelKind::SinTrack { frequency } => Box::new(SinTrackModel::new(frequency)),
        })
    }

    /// Short label used in evaluation reports
    pub fn abbreviation(&self) -> &'static str {
        match self {
            MotionModelKind::Standard => "CV",
            MotionModelKind::ZeroGyro => "ZG",
            MotionModelKind::HyperTan { .. } => "HT",
            MotionModelKind::SinTrack { .. } => "ST",
        }
    }

    /// Every variant with its default parameters (HyperTan 1 rad/s, SinTrack 0.5 Hz)
    pub fn all() -> [MotionModelKind; 4] {
        [
            MotionModelKind::Standard,
            MotionModelKind::ZeroGyro,
            MotionModelKind::HyperTan { max_turn_rate: 1.0 },
            MotionModelKind::SinTrack { frequency: 0.5 },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn state(theta: f64, v: f64, w: f64) -> StateVec {
        StateVec::from_column_slice(&[1.0, 2.0, theta, v, w])
    }

    // Central-difference Jacobian for checking the analytic one
    fn numeric_jacobian(model: &dyn MotionModel, x: &StateVec, dt: f64) -> StateMat {
        let eps = 1e-6;
        let mut j = StateMat::zeros();
        for c in 0..5 {
            let mut xp = *x;
            let mut xm = *x;
            xp[c] += eps;
            xm[c] -= eps;
            let mut d = (model.transition(&xp, dt) - model.transition(&xm, dt)) / (2.0 * eps);
            d[IDX_THETA] = wrap_angle(d[IDX_THETA] * 2.0 * eps) / (2.0 * eps);
            j.set_column(c, &d);
        }
        j
    }

    #[test]
    fn test_standard_straight_line() {
        let x = StandardModel.transition(&state(0.0, 2.0, 0.0), 0.5);
        assert_relative_eq!(x[IDX_X], 2.0, epsilon = 1e-12);
        assert_relative_eq!(x[IDX_Y], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_standard_turn_integrates_heading() {
        let x = StandardModel.transition(&state(0.0, 1.0, PI / 2.0), 1.0);
        assert_relative_eq!(x[IDX_THETA], PI / 2.0, epsilon = 1e-12);
        // Midpoint heading π/4
        assert_relative_eq!(x[IDX_X], 1.0 + (PI / 4.0).cos(), epsilon = 1e-12);
        assert_relative_eq!(x[IDX_Y], 2.0 + (PI / 4.0).sin(), epsilon = 1e-12);
    }

    #[test]
    fn test_zero_gyro_ignores_turn_rate() {
        let x = ZeroGyroModel.transition(&state(0.3, 1.0, 0.8), 1.0);
        assert_relative_eq!(x[IDX_THETA], 0.3, epsilon = 1e-12);
        assert_relative_eq!(x[IDX_W], 0.0);
        assert!(!ZeroGyroModel.tracks_angular_velocity());
    }

    #[test]
    fn test_hyper_tan_saturates() {
        let model = HyperTanModel::new(0.5);
        let x = model.transition(&state(0.0, 0.0, 100.0), 1.0);
        assert_relative_eq!(x[IDX_THETA], 0.5, epsilon = 1e-9);
        assert_relative_eq!(x[IDX_W], 100.0, epsilon = 1e-12);

        // Small rates pass through almost unchanged
        let x = model.transition(&state(0.0, 0.0, 0.01), 1.0);
        assert_relative_eq!(x[IDX_THETA], 0.01, epsilon = 1e-5);
    }

    #[test]
    fn test_sin_track_reduces_to_standard_at_zero_frequency() {
        let x0 = state(0.2, 1.5, 0.3);
        let a = SinTrackModel::new(0.0).transition(&x0, 0.1);
        let b = StandardModel.transition(&x0, 0.1);
        assert_relative_eq!(a, b, epsilon = 1e-12);
    }

    #[test]
    fn test_sin_track_relaxes_turn_rate() {
        // 0.5 Hz: a quarter period in 0.5 s
        let model = SinTrackModel::new(0.5);
        let x = model.transition(&state(0.0, 1.0, 1.0), 0.5);
        assert_relative_eq!(x[IDX_W], 0.0, epsilon = 1e-12);
        assert_relative_eq!(x[IDX_THETA], 1.0 / PI, epsilon = 1e-12);
    }

    #[test]
    fn test_analytic_jacobians_match_numeric() {
        let x0 = state(0.7, 1.3, 0.4);
        for kind in MotionModelKind::all() {
            let model = kind.build().unwrap();
            let analytic = model.jacobian(&x0, 0.2);
            let numeric = numeric_jacobian(model.as_ref(), &x0, 0.2);
            assert_relative_eq!(analytic, numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_process_noise_is_symmetric_psd() {
        let x0 = state(0.7, 1.3, 0.4);
        for kind in MotionModelKind::all() {
            let q = kind.build().unwrap().process_noise(&x0, 0.5, 0.5, 0.1);
            assert_relative_eq!(q, q.transpose(), epsilon = 1e-15);
            for i in 0..5 {
                assert!(q[(i, i)] >= 0.0, "{}: negative variance at {}", kind.abbreviation(), i);
            }
        }
    }

    #[test]
    fn test_kind_serde() {
        let kind: MotionModelKind =
            serde_json::from_str(r#"{"kind": "hyper_tan", "max_turn_rate": 0.8}"#).unwrap();
        assert_eq!(kind, MotionModelKind::HyperTan { max_turn_rate: 0.8 });
        assert_eq!(kind.build().unwrap().name(), "hyper_tan");
    }

    #[test]
    fn test_degenerate_parameters_rejected() {
        for kind in [
            MotionModelKind::HyperTan { max_turn_rate: 0.0 },
            MotionModelKind::HyperTan { max_turn_rate: -1.0 },
            MotionModelKind::HyperTan { max_turn_rate: f64::NAN },
            MotionModelKind::SinTrack { frequency: f64::INFINITY },
            MotionModelKind::SinTrack { frequency: -0.5 },
        ] {
            assert!(matches!(kind.build(), Err(NavError::InvalidConfig(_))), "{:?}", kind);
        }
        for kind in MotionModelKind::all() {
            assert!(kind.validate().is_ok());
        }
    }
}
