use nalgebra::{SMatrix, SVector};

use crate::types::{StateMat, StateVec, STATE_DIM};

/// Standard EKF correction with Joseph-form covariance update
///
/// K = P·Hᵀ·(H·P·Hᵀ + R)⁻¹, x += K·y,
/// P = (I − K·H)·P·(I − K·H)ᵀ + K·R·Kᵀ, then symmetrized.
///
/// # Returns
/// Normalized innovation squared (yᵀ·S⁻¹·y), or `None` when S is singular,
/// in which case `x` and `p` are left untouched.
pub fn joseph_update<const M: usize>(
    x: &mut StateVec,
    p: &mut StateMat,
    h: &SMatrix<f64, M, STATE_DIM>,
    innovation: &SVector<f64, M>,
    r: &SMatrix<f64, M, M>,
) -> Option<f64> {
    let s = h * *p * h.transpose() + r;
    let s_inv = s.try_inverse()?;

    let k = *p * h.transpose() * s_inv;
    *x += k * innovation;

    let i_minus_kh = StateMat::identity() - k * h;
    let joseph = i_minus_kh * *p * i_minus_kh.transpose() + k * r * k.transpose();
    *p = (joseph + joseph.transpose()) * 0.5;

    Some((innovation.transpose() * s_inv * innovation)[(0, 0)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix2, Vector2};

    fn position_h() -> SMatrix<f64, 2, STATE_DIM> {
        let mut h = SMatrix::<f64, 2, STATE_DIM>::zeros();
        h[(0, 0)] = 1.0;
        h[(1, 1)] = 1.0;
        h
    }

    #[test]
    fn test_scalar_fusion_matches_closed_form() {
        let mut x = StateVec::zeros();
        let mut p = StateMat::identity() * 4.0;
        let r = Matrix2::identity() * 1.0;

        let nis = joseph_update(&mut x, &mut p, &position_h(), &Vector2::new(5.0, -5.0), &r).unwrap();

        // Gain 4/(4+1) = 0.8, variance 4·1/(4+1) = 0.8
        assert_relative_eq!(x[0], 4.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], -4.0, epsilon = 1e-12);
        assert_relative_eq!(p[(0, 0)], 0.8, epsilon = 1e-12);
        assert_relative_eq!(p[(2, 2)], 4.0, epsilon = 1e-12);
        assert_relative_eq!(nis, 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_covariance_stays_symmetric() {
        let mut x = StateVec::zeros();
        let mut p = StateMat::from_fn(|r, c| if r == c { 2.0 } else { 0.3 });
        let r = Matrix2::new(0.5, 0.1, 0.1, 0.7);

        joseph_update(&mut x, &mut p, &position_h(), &Vector2::new(1.0, 2.0), &r).unwrap();
        assert_relative_eq!(p, p.transpose(), epsilon = 1e-15);
        assert!(p.symmetric_eigenvalues().iter().all(|&l| l > -1e-12));
    }

    #[test]
    fn test_singular_innovation_leaves_state() {
        let mut x = StateVec::repeat(1.0);
        let mut p = StateMat::zeros();
        let r = Matrix2::zeros();
        let before = (x, p);

        assert!(joseph_update(&mut x, &mut p, &position_h(), &Vector2::new(1.0, 1.0), &r).is_none());
        assert_eq!((x, p), before);
    }
}
