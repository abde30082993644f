use super::{
    ConstantKernel, CovGrad, CovGradError, Kernel, KernelError, RBFKernel,
    SpectralMixtureKernel, WhiteKernel,
};
use nalgebra::base::constraint::{SameNumberOfColumns, ShapeConstraint};
use nalgebra::base::storage::Storage;
use nalgebra::{DMatrix, DVector, Dim, Matrix};

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

/// A single kernel with its own parameters
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub enum LeafKernel {
    Constant(ConstantKernel),
    Rbf(RBFKernel),
    White(WhiteKernel),
    SpectralMixture(SpectralMixtureKernel),
}

macro_rules! leaf_dispatch {
    ($leaf: expr, $k: ident => $body: expr) => {
        match $leaf {
            LeafKernel::Constant($k) => $body,
            LeafKernel::Rbf($k) => $body,
            LeafKernel::White($k) => $body,
            LeafKernel::SpectralMixture($k) => $body,
        }
    };
}

impl Kernel for LeafKernel {
    fn n_parameters(&self) -> usize {
        leaf_dispatch!(self, k => k.n_parameters())
    }

    fn covariance<R1, R2, C1, C2, S1, S2>(
        &self,
        x1: &Matrix<f64, R1, C1, S1>,
        x2: &Matrix<f64, R2, C2, S2>,
    ) -> DMatrix<f64>
    where
        R1: Dim,
        R2: Dim,
        C1: Dim,
        C2: Dim,
        S1: Storage<f64, R1, C1>,
        S2: Storage<f64, R2, C2>,
        ShapeConstraint: SameNumberOfColumns<C1, C2>,
    {
        leaf_dispatch!(self, k => k.covariance(x1, x2))
    }

    fn is_stationary(&self) -> bool {
        leaf_dispatch!(self, k => k.is_stationary())
    }

    fn diag<R, C, S>(&self, x: &Matrix<f64, R, C, S>) -> DVector<f64>
    where
        R: Dim,
        C: Dim,
        S: Storage<f64, R, C>,
    {
        leaf_dispatch!(self, k => k.diag(x))
    }

    fn input_dim(&self) -> Option<usize> {
        leaf_dispatch!(self, k => k.input_dim())
    }

    fn check_input_dim(&self, d: usize) -> Result<(), KernelError> {
        leaf_dispatch!(self, k => k.check_input_dim(d))
    }

    fn parameters(&self) -> DVector<f64> {
        leaf_dispatch!(self, k => k.parameters())
    }

    fn named_parameters(&self) -> Vec<(String, f64)> {
        leaf_dispatch!(self, k => k.named_parameters())
    }

    fn reparameterize(&self, params: &[f64]) -> Result<Self, KernelError> {
        match self {
            Self::Constant(k) => k.reparameterize(params).map(Self::Constant),
            Self::Rbf(k) => k.reparameterize(params).map(Self::Rbf),
            Self::White(k) => k.reparameterize(params).map(Self::White),
            Self::SpectralMixture(k) => {
                k.reparameterize(params).map(Self::SpectralMixture)
            }
        }
    }

    fn covariance_with_gradient<R, C, S>(
        &self,
        x: &Matrix<f64, R, C, S>,
    ) -> Result<(DMatrix<f64>, CovGrad), CovGradError>
    where
        R: Dim,
        C: Dim,
        S: Storage<f64, R, C>,
    {
        leaf_dispatch!(self, k => k.covariance_with_gradient(x))
    }

    fn input_gradient<R, C, S>(
        &self,
        x: &Matrix<f64, R, C, S>,
        dl_dk: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, KernelError>
    where
        R: Dim,
        C: Dim,
        S: Storage<f64, R, C>,
    {
        leaf_dispatch!(self, k => k.input_gradient(x, dl_dk))
    }
}

/// How the children of a composite kernel are combined
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub enum Combine {
    /// `k(a, b) = Σ_c k_c(a, b)`
    Sum,
    /// `k(a, b) = Π_c k_c(a, b)`
    Product,
}

/// A kernel expression tree.
///
/// Kernels are closed under addition and multiplication; `+` and `*` on any
/// kernel build a `Composite` node, flattening nested nodes of the same
/// operation. Evaluation is a walk over the tree.
///
/// ```
/// use exact_gp::kernel::{ConstantKernel, Kernel, RBFKernel, WhiteKernel};
/// use nalgebra::DMatrix;
///
/// let kernel = ConstantKernel::new(2.0).unwrap() * RBFKernel::new(0.5).unwrap()
///     + WhiteKernel::new(0.1).unwrap();
/// assert_eq!(kernel.n_parameters(), 3);
///
/// let x = DMatrix::from_column_slice(3, 1, &[0.0, 0.5, 1.0]);
/// let cov = kernel.covariance(&x, &x);
/// assert!((cov[(0, 0)] - 2.1).abs() < 1E-12);
/// ```
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub enum KernelExpr {
    Leaf(LeafKernel),
    Composite {
        op: Combine,
        children: Vec<KernelExpr>,
    },
}

impl KernelExpr {
    /// Sum of the given kernels
    pub fn sum(children: Vec<KernelExpr>) -> Result<Self, KernelError> {
        Self::composite(Combine::Sum, children)
    }

    /// Product of the given kernels
    pub fn product(children: Vec<KernelExpr>) -> Result<Self, KernelError> {
        Self::composite(Combine::Product, children)
    }

    fn composite(
        op: Combine,
        children: Vec<KernelExpr>,
    ) -> Result<Self, KernelError> {
        let mut children = children.into_iter();
        let first = children.next().ok_or(KernelError::EmptyComposite)?;
        children.try_fold(first, |acc, child| {
            if let Some(d) = acc.input_dim() {
                child.check_input_dim(d)?;
            }
            if let Some(d) = child.input_dim() {
                acc.check_input_dim(d)?;
            }
            Ok(acc.combine(op, child))
        })
    }

    /// `outputscale · exp(-‖a - b‖² / (2 lengthscale²))`
    pub fn scaled_rbf(
        outputscale: f64,
        length_scale: f64,
    ) -> Result<Self, KernelError> {
        Ok(ConstantKernel::new(outputscale)? * RBFKernel::new(length_scale)?)
    }

    /// Combine `self` with `rhs`, merging into an existing node of the same
    /// operation.
    #[must_use]
    pub fn combine(self, op: Combine, rhs: KernelExpr) -> Self {
        let mut children = self.into_children(op);
        children.extend(rhs.into_children(op));
        Self::Composite { op, children }
    }

    fn into_children(self, op: Combine) -> Vec<KernelExpr> {
        match self {
            Self::Composite {
                op: inner,
                children,
            } if inner == op => children,
            other => vec![other],
        }
    }

    /// Leaves of the tree in parameter order
    pub fn leaves(&self) -> Vec<&LeafKernel> {
        match self {
            Self::Leaf(leaf) => vec![leaf],
            Self::Composite { children, .. } => {
                children.iter().flat_map(KernelExpr::leaves).collect()
            }
        }
    }
}

impl From<LeafKernel> for KernelExpr {
    fn from(leaf: LeafKernel) -> Self {
        Self::Leaf(leaf)
    }
}

macro_rules! impl_leaf_from {
    ($type: ty, $variant: ident) => {
        impl From<$type> for LeafKernel {
            fn from(k: $type) -> Self {
                Self::$variant(k)
            }
        }

        impl From<$type> for KernelExpr {
            fn from(k: $type) -> Self {
                Self::Leaf(LeafKernel::$variant(k))
            }
        }
    };
}

impl_leaf_from!(ConstantKernel, Constant);
impl_leaf_from!(RBFKernel, Rbf);
impl_leaf_from!(WhiteKernel, White);
impl_leaf_from!(SpectralMixtureKernel, SpectralMixture);

/// Element-wise product of every matrix but the one at `skip`
fn product_except(covs: &[DMatrix<f64>], skip: usize) -> DMatrix<f64> {
    let (n, m) = covs[skip].shape();
    covs.iter()
        .enumerate()
        .filter(|&(c, _)| c != skip)
        .fold(DMatrix::from_element(n, m, 1.0), |acc, (_, k)| {
            acc.component_mul(k)
        })
}

impl Kernel for KernelExpr {
    fn n_parameters(&self) -> usize {
        match self {
            Self::Leaf(k) => k.n_parameters(),
            Self::Composite { children, .. } => {
                children.iter().map(Kernel::n_parameters).sum()
            }
        }
    }

    fn covariance<R1, R2, C1, C2, S1, S2>(
        &self,
        x1: &Matrix<f64, R1, C1, S1>,
        x2: &Matrix<f64, R2, C2, S2>,
    ) -> DMatrix<f64>
    where
        R1: Dim,
        R2: Dim,
        C1: Dim,
        C2: Dim,
        S1: Storage<f64, R1, C1>,
        S2: Storage<f64, R2, C2>,
        ShapeConstraint: SameNumberOfColumns<C1, C2>,
    {
        let shape = (x1.nrows(), x2.nrows());
        match self {
            Self::Leaf(k) => k.covariance(x1, x2),
            Self::Composite {
                op: Combine::Sum,
                children,
            } => children.iter().fold(
                DMatrix::zeros(shape.0, shape.1),
                |acc, k| acc + k.covariance(x1, x2),
            ),
            Self::Composite {
                op: Combine::Product,
                children,
            } => children.iter().fold(
                DMatrix::from_element(shape.0, shape.1, 1.0),
                |acc, k| acc.component_mul(&k.covariance(x1, x2)),
            ),
        }
    }

    fn is_stationary(&self) -> bool {
        match self {
            Self::Leaf(k) => k.is_stationary(),
            Self::Composite { children, .. } => {
                children.iter().all(Kernel::is_stationary)
            }
        }
    }

    fn diag<R, C, S>(&self, x: &Matrix<f64, R, C, S>) -> DVector<f64>
    where
        R: Dim,
        C: Dim,
        S: Storage<f64, R, C>,
    {
        let n = x.nrows();
        match self {
            Self::Leaf(k) => k.diag(x),
            Self::Composite {
                op: Combine::Sum,
                children,
            } => children
                .iter()
                .fold(DVector::zeros(n), |acc, k| acc + k.diag(x)),
            Self::Composite {
                op: Combine::Product,
                children,
            } => children
                .iter()
                .fold(DVector::from_element(n, 1.0), |acc, k| {
                    acc.component_mul(&k.diag(x))
                }),
        }
    }

    fn input_dim(&self) -> Option<usize> {
        match self {
            Self::Leaf(k) => k.input_dim(),
            Self::Composite { children, .. } => {
                children.iter().find_map(Kernel::input_dim)
            }
        }
    }

    fn check_input_dim(&self, d: usize) -> Result<(), KernelError> {
        match self {
            Self::Leaf(k) => k.check_input_dim(d),
            Self::Composite { children, .. } => {
                children.iter().try_for_each(|k| k.check_input_dim(d))
            }
        }
    }

    fn parameters(&self) -> DVector<f64> {
        match self {
            Self::Leaf(k) => k.parameters(),
            Self::Composite { children, .. } => {
                let params: Vec<f64> = children
                    .iter()
                    .flat_map(|k| k.parameters().iter().copied().collect::<Vec<f64>>())
                    .collect();
                DVector::from_vec(params)
            }
        }
    }

    fn named_parameters(&self) -> Vec<(String, f64)> {
        match self {
            Self::Leaf(k) => k.named_parameters(),
            Self::Composite { children, .. } => children
                .iter()
                .enumerate()
                .flat_map(|(c, k)| {
                    k.named_parameters()
                        .into_iter()
                        .map(move |(name, value)| (format!("{c}.{name}"), value))
                })
                .collect(),
        }
    }

    fn reparameterize(&self, params: &[f64]) -> Result<Self, KernelError> {
        let (kernel, rest) = self.consume_parameters(params)?;
        if rest.is_empty() {
            Ok(kernel)
        } else {
            Err(KernelError::ExtraneousParameters(rest.len()))
        }
    }

    fn consume_parameters<'p>(
        &self,
        params: &'p [f64],
    ) -> Result<(Self, &'p [f64]), KernelError> {
        match self {
            Self::Leaf(k) => {
                let (leaf, rest) = k.consume_parameters(params)?;
                Ok((Self::Leaf(leaf), rest))
            }
            Self::Composite { op, children } => {
                let mut rest = params;
                let mut new_children = Vec::with_capacity(children.len());
                for child in children {
                    let (k, next) = child.consume_parameters(rest)?;
                    new_children.push(k);
                    rest = next;
                }
                Ok((
                    Self::Composite {
                        op: *op,
                        children: new_children,
                    },
                    rest,
                ))
            }
        }
    }

    fn covariance_with_gradient<R, C, S>(
        &self,
        x: &Matrix<f64, R, C, S>,
    ) -> Result<(DMatrix<f64>, CovGrad), CovGradError>
    where
        R: Dim,
        C: Dim,
        S: Storage<f64, R, C>,
    {
        let n = x.nrows();
        let (op, children) = match self {
            Self::Leaf(k) => return k.covariance_with_gradient(x),
            Self::Composite { op, children } => (op, children),
        };

        let parts = children
            .iter()
            .map(|k| k.covariance_with_gradient(x))
            .collect::<Result<Vec<_>, _>>()?;
        let (covs, grads): (Vec<DMatrix<f64>>, Vec<CovGrad>) =
            parts.into_iter().unzip();

        match op {
            Combine::Sum => {
                let cov = covs
                    .iter()
                    .fold(DMatrix::zeros(n, n), |acc, k| acc + k);
                let grad = grads
                    .iter()
                    .try_fold(CovGrad::zeros(n, 0), |acc, g| acc.concat_cols(g))?;
                Ok((cov, grad))
            }
            Combine::Product => {
                let cov = covs.iter().fold(
                    DMatrix::from_element(n, n, 1.0),
                    |acc, k| acc.component_mul(k),
                );
                let mut grad = CovGrad::zeros(n, 0);
                for (c, g) in grads.iter().enumerate() {
                    let scaled = g.component_mul(&product_except(&covs, c))?;
                    grad = grad.concat_cols(&scaled)?;
                }
                Ok((cov, grad))
            }
        }
    }

    fn input_gradient<R, C, S>(
        &self,
        x: &Matrix<f64, R, C, S>,
        dl_dk: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, KernelError>
    where
        R: Dim,
        C: Dim,
        S: Storage<f64, R, C>,
    {
        let zeros = DMatrix::zeros(x.nrows(), x.ncols());
        match self {
            Self::Leaf(k) => k.input_gradient(x, dl_dk),
            Self::Composite {
                op: Combine::Sum,
                children,
            } => children.iter().try_fold(zeros, |acc, k| {
                Ok(acc + k.input_gradient(x, dl_dk)?)
            }),
            Self::Composite {
                op: Combine::Product,
                children,
            } => {
                let covs: Vec<DMatrix<f64>> =
                    children.iter().map(|k| k.covariance(x, x)).collect();
                children.iter().enumerate().try_fold(zeros, |acc, (c, k)| {
                    let weight = dl_dk.component_mul(&product_except(&covs, c));
                    Ok(acc + k.input_gradient(x, &weight)?)
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_kernel() -> Result<(), KernelError> {
        let kernel = ConstantKernel::new(3.0)? + WhiteKernel::new(2.0)?;
        let x = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);

        let expected_cov = DMatrix::from_row_slice(2, 2, &[5.0, 3.0, 3.0, 5.0]);

        let expected_grad = CovGrad::new_unchecked(&[
            DMatrix::from_row_slice(2, 2, &[3.0, 3.0, 3.0, 3.0]),
            DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 2.0]),
        ]);

        let (cov, grad) = kernel.covariance_with_gradient(&x)?;
        assert!(cov.relative_eq(&expected_cov, 1E-7, 1E-7));
        assert!(grad.relative_eq(&expected_grad, 1E-7, 1E-7));
        assert_eq!(kernel.diag(&x), DVector::from_element(2, 5.0));
        Ok(())
    }

    #[test]
    fn product_kernel() -> Result<(), KernelError> {
        let kernel = ConstantKernel::new(3.0)? * RBFKernel::new(5.0)?;
        let x = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let y = DMatrix::from_row_slice(2, 2, &[5.0, 7.0, 6.0, 8.0]);

        let expected_cov = DMatrix::from_row_slice(
            2,
            2,
            &[
                1.3212949635179978,
                0.8856905007720425,
                2.313154757410699,
                1.8195919791379003,
            ],
        );
        let cov = kernel.covariance(&x, &y);
        assert!(cov.relative_eq(&expected_cov, 1E-7, 1E-7));

        // Symmetric Cov and Grad
        let expected_cov = DMatrix::from_row_slice(
            2,
            2,
            &[3.0, 2.556431366898634, 2.556431366898634, 3.0],
        );

        let expected_grad = CovGrad::new_unchecked(&[
            DMatrix::from_row_slice(
                2,
                2,
                &[3.0, 2.556431366898634, 2.556431366898634, 3.0],
            ),
            DMatrix::from_row_slice(
                2,
                2,
                &[0.0, 0.8180580374075628, 0.8180580374075628, 0.0],
            ),
        ]);

        let (cov, grad) = kernel.covariance_with_gradient(&x)?;
        assert!(cov.relative_eq(&expected_cov, 1E-7, 1E-7));
        assert!(grad.relative_eq(&expected_grad, 1E-7, 1E-7));
        Ok(())
    }

    #[test]
    fn same_operations_are_flattened() -> Result<(), KernelError> {
        let kernel = ConstantKernel::new(1.0)?
            + RBFKernel::new(1.0)?
            + WhiteKernel::new(1.0)?;
        match &kernel {
            KernelExpr::Composite { op, children } => {
                assert_eq!(*op, Combine::Sum);
                assert_eq!(children.len(), 3);
            }
            KernelExpr::Leaf(_) => panic!("expected a composite"),
        }

        let mixed = KernelExpr::scaled_rbf(2.0, 0.5)? + WhiteKernel::new(0.1)?;
        match &mixed {
            KernelExpr::Composite { op, children } => {
                assert_eq!(*op, Combine::Sum);
                assert_eq!(children.len(), 2);
            }
            KernelExpr::Leaf(_) => panic!("expected a composite"),
        }
        assert_eq!(mixed.leaves().len(), 3);
        Ok(())
    }

    #[test]
    fn parameters_flow_through_the_tree() -> Result<(), KernelError> {
        let kernel = KernelExpr::scaled_rbf(2.0, 0.5)? + WhiteKernel::new(0.1)?;
        let params = kernel.parameters();
        assert_eq!(params.len(), 3);
        assert::close(params[0], 2.0_f64.ln(), 1E-12);
        assert::close(params[1], 0.5_f64.ln(), 1E-12);
        assert::close(params[2], 0.1_f64.ln(), 1E-12);

        let again = kernel.reparameterize(params.as_slice())?;
        assert_eq!(again, kernel);

        assert_eq!(
            kernel.reparameterize(&[0.0, 0.0]),
            Err(KernelError::MissingParameters(1))
        );
        assert_eq!(
            kernel.reparameterize(&[0.0; 5]),
            Err(KernelError::ExtraneousParameters(2))
        );

        let names: Vec<String> =
            kernel.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["0.0.outputscale", "0.1.length_scale", "1.noise_level"]);
        Ok(())
    }

    #[test]
    fn children_of_different_dimension_are_caught() -> Result<(), KernelError>
    {
        let one = SpectralMixtureKernel::with_components(1, 1)?;
        let two = SpectralMixtureKernel::with_components(1, 2)?;
        assert_eq!(
            KernelExpr::sum(vec![one.clone().into(), two.clone().into()]),
            Err(KernelError::DimensionMismatch {
                expected: 2,
                given: 1
            })
        );

        // the operators cannot fail, the check finds the bad child
        let kernel = RBFKernel::new(1.0)? * (one + two);
        assert_eq!(kernel.input_dim(), Some(1));
        assert_eq!(
            kernel.check_input_dim(1),
            Err(KernelError::DimensionMismatch {
                expected: 2,
                given: 1
            })
        );

        // evaluation on the wrong width is still total
        let x = DMatrix::from_row_slice(3, 1, &[0.0, 0.5, 1.0]);
        assert_eq!(kernel.covariance(&x, &x).shape(), (3, 3));
        Ok(())
    }

    #[test]
    fn empty_composites_are_rejected() {
        assert_eq!(KernelExpr::sum(vec![]), Err(KernelError::EmptyComposite));
        assert_eq!(KernelExpr::product(vec![]), Err(KernelError::EmptyComposite));
    }

    #[test]
    fn product_input_gradient_matches_finite_differences(
    ) -> Result<(), KernelError> {
        let kernel = (RBFKernel::new(0.8)? * RBFKernel::new(1.3)?)
            + ConstantKernel::new(0.5)? * RBFKernel::new(0.4)?;
        let x = DMatrix::from_row_slice(3, 1, &[0.1, 0.6, -0.5]);
        let w = DMatrix::from_row_slice(
            3,
            3,
            &[1.0, -0.3, 0.2, 0.5, 0.4, -1.1, 0.0, 0.9, -0.2],
        );
        let loss = |x: &DMatrix<f64>| kernel.covariance(x, x).dot(&w);
        let grad = kernel.input_gradient(&x, &w)?;
        let h = 1E-6;
        for i in 0..3 {
            let mut xp = x.clone();
            xp[(i, 0)] += h;
            let mut xm = x.clone();
            xm[(i, 0)] -= h;
            assert::close(grad[(i, 0)], (loss(&xp) - loss(&xm)) / (2.0 * h), 1E-6);
        }
        Ok(())
    }

    #[test]
    fn composite_gradient_matches_finite_differences() -> Result<(), KernelError>
    {
        let kernel = KernelExpr::scaled_rbf(1.5, 0.7)? + WhiteKernel::new(0.2)?;
        let x = DMatrix::from_row_slice(3, 1, &[0.0, 0.4, 1.1]);
        let (_, grad) = kernel.covariance_with_gradient(&x)?;
        let theta = kernel.parameters();
        let h = 1E-6;
        for k in 0..theta.len() {
            let mut up = theta.clone();
            up[k] += h;
            let mut down = theta.clone();
            down[k] -= h;
            let fd = (kernel.reparameterize(up.as_slice())?.covariance(&x, &x)
                - kernel.reparameterize(down.as_slice())?.covariance(&x, &x))
                / (2.0 * h);
            assert!(fd.relative_eq(&grad[k], 1E-6, 1E-6));
        }
        Ok(())
    }
}
