//! Linear algebra type system for the route localizer
//!
//! Compile-time dimension checking and clean type aliases
//! for the planar EKF and its measurement models.

use nalgebra::{SMatrix, SVector};

// ===== State Dimensions =====
pub const STATE_DIM: usize = 5; // (x, y, theta, v, w)

// ===== State indices =====
pub const IDX_X: usize = 0;
pub const IDX_Y: usize = 1;
pub const IDX_THETA: usize = 2;
pub const IDX_V: usize = 3;
pub const IDX_W: usize = 4;

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_POS: usize = 2; // (x, y)
pub const MEASURE_DIM_POLAR: usize = 2; // (range, bearing)
pub const MEASURE_DIM_ANGLE: usize = 1; // heading or bearing
pub const NOISE_DIM: usize = 2; // (v, w) random walk

// ===== State Types =====
pub type StateVec = SVector<f64, STATE_DIM>;
pub type StateMat = SMatrix<f64, STATE_DIM, STATE_DIM>;

// Process noise input mapping (5×2)
pub type NoiseInput = SMatrix<f64, STATE_DIM, NOISE_DIM>;
pub type NoiseMat = SMatrix<f64, NOISE_DIM, NOISE_DIM>;

// Measurement types
pub type PosVec = SVector<f64, MEASURE_DIM_POS>;
pub type PosNoise = SMatrix<f64, MEASURE_DIM_POS, MEASURE_DIM_POS>;
pub type JacobianPos = SMatrix<f64, MEASURE_DIM_POS, STATE_DIM>; // 2×5
pub type JacobianPolar = SMatrix<f64, MEASURE_DIM_POLAR, STATE_DIM>; // 2×5
pub type JacobianAngle = SMatrix<f64, MEASURE_DIM_ANGLE, STATE_DIM>; // 1×5
