//! Dense linear algebra helpers shared by the model and the distributions

use log::warn;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

use crate::consts::{DEFAULT_INITIAL_JITTER, DEFAULT_JITTER_TRIES};
use crate::error::{GpError, Result};

/// Bounded sequence of diagonal jitters tried when a covariance matrix is
/// not numerically positive definite.
///
/// The jitters tried are `initial`, `initial * factor`, ... for `max_tries`
/// attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct JitterPolicy {
    initial: f64,
    factor: f64,
    max_tries: usize,
}

impl Default for JitterPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_JITTER,
            factor: 10.0,
            max_tries: DEFAULT_JITTER_TRIES,
        }
    }
}

impl JitterPolicy {
    /// Create a new jitter policy
    pub fn new(initial: f64, factor: f64, max_tries: usize) -> Result<Self> {
        if !(initial > 0.0 && initial.is_finite()) {
            Err(GpError::invalid_parameter("jitter.initial", initial))
        } else if !(factor >= 1.0 && factor.is_finite()) {
            Err(GpError::invalid_parameter("jitter.factor", factor))
        } else {
            Ok(Self {
                initial,
                factor,
                max_tries,
            })
        }
    }

    /// A policy that never adds jitter
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_tries: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn max_tries(&self) -> usize {
        self.max_tries
    }

    /// The jitter values in the order they are tried
    pub fn jitters(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.max_tries).map(move |i| self.initial * self.factor.powi(i as i32))
    }
}

/// Cholesky factor of a symmetric matrix, retrying with growing diagonal
/// jitter when the plain factorization fails.
///
/// Returns the factor together with the jitter that was needed (zero when
/// none).
pub fn cholesky_with_jitter(
    cov: &DMatrix<f64>,
    policy: &JitterPolicy,
) -> Result<(Cholesky<f64, Dyn>, f64)> {
    if cov.iter().any(|x| !x.is_finite()) {
        return Err(GpError::NumericalInstability {
            tries: 0,
            max_jitter: 0.0,
        });
    }

    if let Some(ch) = Cholesky::new(cov.clone()) {
        return Ok((ch, 0.0));
    }

    let mut max_jitter = 0.0;
    for jitter in policy.jitters() {
        warn!(
            "Covariance of size {} is not positive definite, retrying with jitter {:e}",
            cov.nrows(),
            jitter
        );
        let mut jittered = cov.clone();
        for i in 0..jittered.nrows() {
            jittered[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(jittered) {
            return Ok((ch, jitter));
        }
        max_jitter = jitter;
    }

    Err(GpError::NumericalInstability {
        tries: policy.max_tries(),
        max_jitter,
    })
}

/// Solution of `A X = B` for a symmetric positive definite `A`, kept
/// together with the factor of `A` for the backward pass.
///
/// `B` holds one right-hand side per column.
///
/// ```
/// use exact_gp::linalg::{InvMatmul, JitterPolicy};
/// use nalgebra::DMatrix;
///
/// let a = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);
/// let b = DMatrix::from_row_slice(2, 1, &[3.0, 3.0]);
/// let solve = InvMatmul::new(&a, &b, &JitterPolicy::none()).unwrap();
/// assert!((solve.solution()[0] - 1.0).abs() < 1E-12);
/// ```
#[derive(Clone, Debug)]
pub struct InvMatmul {
    chol: Cholesky<f64, Dyn>,
    solution: DMatrix<f64>,
}

impl InvMatmul {
    pub fn new(
        a: &DMatrix<f64>,
        b: &DMatrix<f64>,
        policy: &JitterPolicy,
    ) -> Result<Self> {
        if !a.is_square() {
            return Err(GpError::shape("matrix columns", a.nrows(), a.ncols()));
        }
        if b.nrows() != a.nrows() {
            return Err(GpError::shape("right-hand side rows", a.nrows(), b.nrows()));
        }
        let (chol, _) = cholesky_with_jitter(a, policy)?;
        let solution = chol.solve(b);
        Ok(Self { chol, solution })
    }

    /// `A⁻¹ B`
    #[must_use]
    pub fn solution(&self) -> &DMatrix<f64> {
        &self.solution
    }

    #[must_use]
    pub fn into_solution(self) -> DMatrix<f64> {
        self.solution
    }

    /// Pull the gradient `G = dL/dX` back to `(dL/dA, dL/dB)`, that is
    /// `(-A⁻ᵀ G Xᵀ, A⁻ᵀ G)`
    pub fn backward(
        &self,
        grad: &DMatrix<f64>,
    ) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
        if grad.nrows() != self.solution.nrows() {
            return Err(GpError::shape(
                "output gradient rows",
                self.solution.nrows(),
                grad.nrows(),
            ));
        }
        if grad.ncols() != self.solution.ncols() {
            return Err(GpError::shape(
                "output gradient columns",
                self.solution.ncols(),
                grad.ncols(),
            ));
        }
        let grad_b = self.chol.solve(grad);
        let grad_a = -(&grad_b * self.solution.transpose());
        Ok((grad_a, grad_b))
    }
}

/// `A⁻¹ B` through the jittered Cholesky factor of `A`
pub fn inv_matmul(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    policy: &JitterPolicy,
) -> Result<DMatrix<f64>> {
    InvMatmul::new(a, b, policy).map(InvMatmul::into_solution)
}

/// [`InvMatmul`] for each `(A_i, B_i)` pair of a batch
pub fn batch_inv_matmul(
    mats: &[DMatrix<f64>],
    rhs: &[DMatrix<f64>],
    policy: &JitterPolicy,
) -> Result<Vec<InvMatmul>> {
    if mats.len() != rhs.len() {
        return Err(GpError::shape("batch size", mats.len(), rhs.len()));
    }
    mats.iter()
        .zip(rhs.iter())
        .map(|(a, b)| InvMatmul::new(a, b, policy))
        .collect()
}

/// log |A| from the Cholesky factor of A
#[must_use]
pub fn ln_det(ch: &Cholesky<f64, Dyn>) -> f64 {
    2.0 * ch.l_dirty().diagonal().map(f64::ln).sum()
}

/// x xᵀ
#[inline]
#[must_use]
pub fn outer_product_self(col: &DVector<f64>) -> DMatrix<f64> {
    col * col.transpose()
}

/// Check that the matrix holds only finite values
pub(crate) fn ensure_finite(name: &str, values: &[f64]) -> Result<()> {
    if values.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(GpError::InvalidInput(format!("{name} contains non-finite values")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_distr::{Distribution, StandardNormal};
    use rand_xoshiro::Xoshiro256Plus;

    fn randn(rows: usize, cols: usize, rng: &mut Xoshiro256Plus) -> DMatrix<f64> {
        DMatrix::from_fn(rows, cols, |_, _| StandardNormal.sample(rng))
    }

    fn tridiagonal() -> DMatrix<f64> {
        DMatrix::from_row_slice(3, 3, &[3.0, -1.0, 0.0, -1.0, 3.0, 0.0, 0.0, 0.0, 3.0])
    }

    // reference through the explicit inverse: X = A⁻¹B,
    // dL/dA = -A⁻ᵀ G Xᵀ, dL/dB = A⁻ᵀ G
    fn check_against_inverse(
        a: &DMatrix<f64>,
        b: &DMatrix<f64>,
        grad: &DMatrix<f64>,
        solve: &InvMatmul,
    ) {
        let inv = a.clone().try_inverse().unwrap();
        let x = &inv * b;
        assert!(solve.solution().relative_eq(&x, 1E-10, 1E-10));

        let (grad_a, grad_b) = solve.backward(grad).unwrap();
        let expected_b = inv.transpose() * grad;
        let expected_a = -(&expected_b * x.transpose());
        assert!(grad_a.relative_eq(&expected_a, 1E-10, 1E-10));
        assert!(grad_b.relative_eq(&expected_b, 1E-10, 1E-10));
    }

    #[test]
    fn inv_matmul_single_rhs() {
        let mut rng = Xoshiro256Plus::seed_from_u64(0x1a);
        let a = tridiagonal();
        let b = randn(3, 1, &mut rng);
        let grad = randn(3, 1, &mut rng);
        let solve = InvMatmul::new(&a, &b, &JitterPolicy::none()).unwrap();
        check_against_inverse(&a, &b, &grad, &solve);
    }

    #[test]
    fn inv_matmul_several_rhs() {
        let mut rng = Xoshiro256Plus::seed_from_u64(0x2b);
        let a = tridiagonal();
        let b = randn(3, 4, &mut rng);
        let grad = randn(3, 4, &mut rng);
        let solve = InvMatmul::new(&a, &b, &JitterPolicy::none()).unwrap();
        check_against_inverse(&a, &b, &grad, &solve);
        assert_eq!(
            inv_matmul(&a, &b, &JitterPolicy::none()).unwrap(),
            solve.into_solution()
        );
    }

    #[test]
    fn inv_matmul_batch() {
        let mut rng = Xoshiro256Plus::seed_from_u64(0x3c);
        let mats = vec![
            tridiagonal(),
            DMatrix::from_row_slice(
                3,
                3,
                &[10.0, -2.0, 1.0, -2.0, 10.0, 0.0, 1.0, 0.0, 10.0],
            ),
        ];
        let rhs = vec![randn(3, 4, &mut rng), randn(3, 4, &mut rng)];
        let grads = vec![randn(3, 4, &mut rng), randn(3, 4, &mut rng)];
        let solves =
            batch_inv_matmul(&mats, &rhs, &JitterPolicy::none()).unwrap();
        assert_eq!(solves.len(), 2);
        for i in 0..2 {
            check_against_inverse(&mats[i], &rhs[i], &grads[i], &solves[i]);
        }
    }

    #[test]
    fn inv_matmul_gradient_matches_symmetric_finite_differences() {
        let mut rng = Xoshiro256Plus::seed_from_u64(0x4d);
        let a = tridiagonal();
        let b = randn(3, 2, &mut rng);
        let g = randn(3, 2, &mut rng);
        let policy = JitterPolicy::none();
        let loss = |a: &DMatrix<f64>, b: &DMatrix<f64>| {
            inv_matmul(a, b, &policy).unwrap().dot(&g)
        };
        let (grad_a, grad_b) =
            InvMatmul::new(&a, &b, &policy).unwrap().backward(&g).unwrap();

        let h = 1E-6;
        for i in 0..3 {
            for j in 0..=i {
                // A stays symmetric, so both mirrored entries move
                let mut up = a.clone();
                let mut down = a.clone();
                up[(i, j)] += h;
                down[(i, j)] -= h;
                if i != j {
                    up[(j, i)] += h;
                    down[(j, i)] -= h;
                }
                let fd = (loss(&up, &b) - loss(&down, &b)) / (2.0 * h);
                let analytic = if i == j {
                    grad_a[(i, i)]
                } else {
                    grad_a[(i, j)] + grad_a[(j, i)]
                };
                assert::close(analytic, fd, 1E-6);
            }
            for k in 0..2 {
                let mut up = b.clone();
                let mut down = b.clone();
                up[(i, k)] += h;
                down[(i, k)] -= h;
                let fd = (loss(&a, &up) - loss(&a, &down)) / (2.0 * h);
                assert::close(grad_b[(i, k)], fd, 1E-6);
            }
        }
    }

    #[test]
    fn inv_matmul_checks_shapes() {
        let a = tridiagonal();
        let policy = JitterPolicy::none();
        let res = inv_matmul(&a, &DMatrix::zeros(2, 1), &policy);
        assert!(matches!(res, Err(GpError::ShapeMismatch { .. })));
        let res = inv_matmul(&DMatrix::zeros(3, 2), &DMatrix::zeros(3, 1), &policy);
        assert!(matches!(res, Err(GpError::ShapeMismatch { .. })));
        let res = batch_inv_matmul(&[a.clone()], &[], &policy);
        assert!(matches!(res, Err(GpError::ShapeMismatch { .. })));

        let solve = InvMatmul::new(&a, &DMatrix::zeros(3, 2), &policy).unwrap();
        assert!(solve.backward(&DMatrix::zeros(3, 1)).is_err());
    }

    #[test]
    fn jitters_grow_geometrically() {
        let policy = JitterPolicy::default();
        let jitters: Vec<f64> = policy.jitters().collect();
        assert_eq!(jitters.len(), 4);
        assert::close(jitters[0], 1E-6, 1E-18);
        assert::close(jitters[3], 1E-3, 1E-15);
    }

    #[test]
    fn invalid_policy_is_rejected() {
        assert!(JitterPolicy::new(0.0, 10.0, 3).is_err());
        assert!(JitterPolicy::new(1E-6, 0.5, 3).is_err());
        assert!(JitterPolicy::new(1E-6, 10.0, 3).is_ok());
    }

    #[test]
    fn positive_definite_needs_no_jitter() {
        let a = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        let (ch, jitter) =
            cholesky_with_jitter(&a, &JitterPolicy::default()).unwrap();
        assert_eq!(jitter, 0.0);
        assert::close(ln_det(&ch), (2.0_f64 - 0.25).ln(), 1E-12);
    }

    #[test]
    fn singular_matrix_is_rescued_by_jitter() {
        // rank one
        let a = DMatrix::from_element(3, 3, 1.0);
        let (_, jitter) =
            cholesky_with_jitter(&a, &JitterPolicy::default()).unwrap();
        assert!(jitter > 0.0);
    }

    #[test]
    fn indefinite_matrix_fails_after_retries() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        let err = cholesky_with_jitter(&a, &JitterPolicy::default())
            .expect_err("cannot be factored");
        match err {
            GpError::NumericalInstability { tries, max_jitter } => {
                assert_eq!(tries, 4);
                assert::close(max_jitter, 1E-3, 1E-12);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn non_finite_matrix_fails_immediately() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, f64::NAN, f64::NAN, 1.0]);
        assert!(matches!(
            cholesky_with_jitter(&a, &JitterPolicy::default()),
            Err(GpError::NumericalInstability { tries: 0, .. })
        ));
    }
}
