//! Learned feature maps applied to the inputs before the mean and kernel
//!
//! A deep kernel is an ordinary kernel evaluated on `g_θ(x)` where `g_θ` is a
//! small neural network. The network output is rescaled into `[-1, 1]` per
//! dimension. While training the bounds follow the training features of the
//! current parameters (and gradients flow through them); once the model
//! enters evaluation they are frozen from the training set so that query
//! batches are mapped with the same affine transform.

use nalgebra::{DMatrix, DVector};
use rand::Rng;

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

use crate::error::{GpError, Result};

/// A differentiable map from `ℝ^d` to `ℝ^k` applied row-wise
pub trait FeatureMap: std::fmt::Debug + Clone + PartialEq {
    fn n_parameters(&self) -> usize;

    fn parameters(&self) -> DVector<f64>;

    fn reparameterize(&self, params: &[f64]) -> Result<Self>;

    /// Input dimension the map was built for, if it is fixed
    fn input_dim(&self) -> Option<usize>;

    /// Dimension of the features produced from `input_dim` inputs
    fn output_dim(&self, input_dim: usize) -> usize;

    /// Map every row of `x`
    fn forward(&self, x: &DMatrix<f64>) -> DMatrix<f64>;

    /// Gradient of a scalar `L` w.r.t. the parameters given
    /// `dl_dz = ∂L/∂forward(x)`
    fn backward(&self, x: &DMatrix<f64>, dl_dz: &DMatrix<f64>) -> DVector<f64>;
}

/// `g(x) = x`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
pub struct Identity;

impl FeatureMap for Identity {
    fn n_parameters(&self) -> usize {
        0
    }

    fn parameters(&self) -> DVector<f64> {
        DVector::zeros(0)
    }

    fn reparameterize(&self, params: &[f64]) -> Result<Self> {
        if params.is_empty() {
            Ok(Self)
        } else {
            Err(GpError::shape("feature map parameters", 0, params.len()))
        }
    }

    fn input_dim(&self) -> Option<usize> {
        None
    }

    fn output_dim(&self, input_dim: usize) -> usize {
        input_dim
    }

    fn forward(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        x.clone()
    }

    fn backward(&self, _x: &DMatrix<f64>, _dl_dz: &DMatrix<f64>) -> DVector<f64> {
        DVector::zeros(0)
    }
}

/// Element-wise nonlinearity of a dense layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub enum Activation {
    Relu,
    Tanh,
    Linear,
}

impl Activation {
    fn apply(self, z: f64) -> f64 {
        match self {
            Self::Relu => z.max(0.0),
            Self::Tanh => z.tanh(),
            Self::Linear => z,
        }
    }

    /// Derivative at pre-activation `z` with output `a`
    fn derivative(self, z: f64, a: f64) -> f64 {
        match self {
            Self::Relu => {
                if z > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Tanh => 1.0 - a * a,
            Self::Linear => 1.0,
        }
    }
}

/// Fully connected layer `a = act(x Wᵀ + b)`
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct Dense {
    /// `out × in`
    weights: DMatrix<f64>,
    bias: DVector<f64>,
    activation: Activation,
}

impl Dense {
    pub fn new(
        weights: DMatrix<f64>,
        bias: DVector<f64>,
        activation: Activation,
    ) -> Result<Self> {
        if weights.nrows() != bias.len() {
            return Err(GpError::shape(
                "dense layer bias",
                weights.nrows(),
                bias.len(),
            ));
        }
        if weights.is_empty() {
            return Err(GpError::InvalidInput(
                "a dense layer needs at least one weight".to_string(),
            ));
        }
        crate::linalg::ensure_finite("dense layer weights", weights.as_slice())?;
        crate::linalg::ensure_finite("dense layer bias", bias.as_slice())?;
        Ok(Self {
            weights,
            bias,
            activation,
        })
    }

    /// Glorot-uniform weights and zero bias
    pub fn glorot<R: Rng>(
        n_in: usize,
        n_out: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self> {
        if n_in == 0 || n_out == 0 {
            return Err(GpError::InvalidInput(
                "a dense layer needs at least one weight".to_string(),
            ));
        }
        let limit = (6.0 / (n_in + n_out) as f64).sqrt();
        let weights =
            DMatrix::from_fn(n_out, n_in, |_, _| rng.gen_range(-limit..limit));
        Self::new(weights, DVector::zeros(n_out), activation)
    }

    #[must_use]
    pub fn n_in(&self) -> usize {
        self.weights.ncols()
    }

    #[must_use]
    pub fn n_out(&self) -> usize {
        self.weights.nrows()
    }

    fn n_parameters(&self) -> usize {
        self.weights.len() + self.bias.len()
    }

    fn pre_activation(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        let mut z = x * self.weights.transpose();
        for mut row in z.row_iter_mut() {
            row += self.bias.transpose();
        }
        z
    }
}

/// Multi-layer perceptron feature extractor
///
/// Parameters are laid out layer by layer, each as its weights (row-major)
/// followed by its bias.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct Mlp {
    layers: Vec<Dense>,
}

impl Mlp {
    /// Build a network from explicit layers; consecutive layers must agree
    /// in size. An empty network is the identity map.
    pub fn from_layers(layers: Vec<Dense>) -> Result<Self> {
        for pair in layers.windows(2) {
            if pair[0].n_out() != pair[1].n_in() {
                return Err(GpError::shape(
                    "consecutive dense layers",
                    pair[0].n_out(),
                    pair[1].n_in(),
                ));
            }
        }
        Ok(Self { layers })
    }

    /// Randomly initialised network `input_dim → hidden... → output_dim`
    /// with `activation` on the hidden layers and a linear output layer
    pub fn new<R: Rng>(
        input_dim: usize,
        hidden: &[usize],
        output_dim: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self> {
        let sizes: Vec<usize> = std::iter::once(input_dim)
            .chain(hidden.iter().copied())
            .chain(std::iter::once(output_dim))
            .collect();
        let n_layers = sizes.len() - 1;
        let layers = sizes
            .windows(2)
            .enumerate()
            .map(|(l, w)| {
                let act = if l + 1 == n_layers {
                    Activation::Linear
                } else {
                    activation
                };
                Dense::glorot(w[0], w[1], act, rng)
            })
            .collect::<Result<Vec<Dense>>>()?;
        Self::from_layers(layers)
    }

    #[must_use]
    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }

    /// Pre-activations and activations of every layer
    fn trace(&self, x: &DMatrix<f64>) -> Vec<(DMatrix<f64>, DMatrix<f64>)> {
        let mut out: Vec<(DMatrix<f64>, DMatrix<f64>)> =
            Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let input = out.last().map_or(x, |(_, a)| a);
            let z = layer.pre_activation(input);
            let a = z.map(|v| layer.activation.apply(v));
            out.push((z, a));
        }
        out
    }
}

impl FeatureMap for Mlp {
    fn n_parameters(&self) -> usize {
        self.layers.iter().map(Dense::n_parameters).sum()
    }

    fn parameters(&self) -> DVector<f64> {
        let params: Vec<f64> = self
            .layers
            .iter()
            .flat_map(|layer| {
                layer
                    .weights
                    .transpose()
                    .iter()
                    .chain(layer.bias.iter())
                    .copied()
                    .collect::<Vec<f64>>()
            })
            .collect();
        DVector::from_vec(params)
    }

    fn reparameterize(&self, params: &[f64]) -> Result<Self> {
        if params.len() != self.n_parameters() {
            return Err(GpError::shape(
                "feature map parameters",
                self.n_parameters(),
                params.len(),
            ));
        }
        let mut rest = params;
        let mut layers = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (w, tail) = rest.split_at(layer.weights.len());
            let (b, tail) = tail.split_at(layer.bias.len());
            layers.push(Dense::new(
                DMatrix::from_row_slice(layer.n_out(), layer.n_in(), w),
                DVector::from_column_slice(b),
                layer.activation,
            )?);
            rest = tail;
        }
        Ok(Self { layers })
    }

    fn input_dim(&self) -> Option<usize> {
        self.layers.first().map(Dense::n_in)
    }

    fn output_dim(&self, input_dim: usize) -> usize {
        self.layers.last().map_or(input_dim, Dense::n_out)
    }

    fn forward(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        self.trace(x).pop().map_or_else(|| x.clone(), |(_, a)| a)
    }

    fn backward(&self, x: &DMatrix<f64>, dl_dz: &DMatrix<f64>) -> DVector<f64> {
        let trace = self.trace(x);
        let mut grads: Vec<Vec<f64>> = vec![Vec::new(); self.layers.len()];
        let mut upstream = dl_dz.clone();

        for (l, layer) in self.layers.iter().enumerate().rev() {
            let (z, a) = &trace[l];
            let input = if l == 0 { x } else { &trace[l - 1].1 };
            let dz = upstream.zip_map(&z.zip_map(a, |zv, av| {
                layer.activation.derivative(zv, av)
            }), |g, d| g * d);

            let dw = dz.transpose() * input;
            let db = dz.row_sum().transpose();
            grads[l] = dw
                .transpose()
                .iter()
                .chain(db.iter())
                .copied()
                .collect();
            upstream = &dz * &layer.weights;
        }

        DVector::from_vec(grads.concat())
    }
}

/// Per-dimension affine map of the features onto `[-1, 1]`
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct FeatureBounds {
    lower: DVector<f64>,
    upper: DVector<f64>,
}

impl FeatureBounds {
    /// Column-wise minimum and maximum of `z`
    #[must_use]
    pub fn of(z: &DMatrix<f64>) -> Self {
        let lower = DVector::from_iterator(z.ncols(), z.column_iter().map(|c| c.min()));
        let upper = DVector::from_iterator(z.ncols(), z.column_iter().map(|c| c.max()));
        Self { lower, upper }
    }

    #[must_use]
    pub fn lower(&self) -> &DVector<f64> {
        &self.lower
    }

    #[must_use]
    pub fn upper(&self) -> &DVector<f64> {
        &self.upper
    }

    /// `2 (z - lower) / (upper - lower) - 1`, zero on constant dimensions
    #[must_use]
    pub fn rescale(&self, z: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(z.nrows(), z.ncols(), |i, p| {
            let range = self.upper[p] - self.lower[p];
            if range > 0.0 {
                2.0 * (z[(i, p)] - self.lower[p]) / range - 1.0
            } else {
                0.0
            }
        })
    }
}

/// Feature map followed by optional rescaling into `[-1, 1]`
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct InputTransform<F> {
    map: F,
    rescale: bool,
    frozen: Option<FeatureBounds>,
}

impl Default for InputTransform<Identity> {
    fn default() -> Self {
        Self::new(Identity)
    }
}

impl<F: FeatureMap> InputTransform<F> {
    /// Apply `map` without rescaling
    pub fn new(map: F) -> Self {
        Self {
            map,
            rescale: false,
            frozen: None,
        }
    }

    /// Apply `map` and rescale its output into `[-1, 1]`
    pub fn with_rescaling(map: F) -> Self {
        Self {
            map,
            rescale: true,
            frozen: None,
        }
    }

    pub fn map(&self) -> &F {
        &self.map
    }

    pub fn rescales(&self) -> bool {
        self.rescale
    }

    /// Bounds fixed at the last switch to evaluation, if any
    pub fn frozen_bounds(&self) -> Option<&FeatureBounds> {
        self.frozen.as_ref()
    }

    pub fn n_parameters(&self) -> usize {
        self.map.n_parameters()
    }

    pub fn parameters(&self) -> DVector<f64> {
        self.map.parameters()
    }

    /// New transform with new map parameters; frozen bounds are dropped
    pub fn reparameterize(&self, params: &[f64]) -> Result<Self> {
        Ok(Self {
            map: self.map.reparameterize(params)?,
            rescale: self.rescale,
            frozen: None,
        })
    }

    /// Dimension of the transformed inputs
    pub fn output_dim(&self, input_dim: usize) -> usize {
        self.map.output_dim(input_dim)
    }

    pub(crate) fn freeze(&mut self, x_train: &DMatrix<f64>) {
        self.frozen = if self.rescale {
            Some(FeatureBounds::of(&self.map.forward(x_train)))
        } else {
            None
        };
    }

    pub(crate) fn unfreeze(&mut self) {
        self.frozen = None;
    }

    /// Transform `x` using the frozen bounds, or the bounds of `x` itself
    /// when none are frozen
    pub fn apply(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        let z = self.map.forward(x);
        if !self.rescale {
            return z;
        }
        match &self.frozen {
            Some(bounds) => bounds.rescale(&z),
            None => FeatureBounds::of(&z).rescale(&z),
        }
    }

    /// Transform `x` using the frozen bounds, or the bounds of the features
    /// of `reference` when none are frozen
    pub fn apply_with_reference(
        &self,
        x: &DMatrix<f64>,
        reference: &DMatrix<f64>,
    ) -> DMatrix<f64> {
        let z = self.map.forward(x);
        if !self.rescale {
            return z;
        }
        match &self.frozen {
            Some(bounds) => bounds.rescale(&z),
            None => FeatureBounds::of(&self.map.forward(reference)).rescale(&z),
        }
    }

    /// Gradient of a scalar `L` w.r.t. the map parameters given
    /// `dl_ds = ∂L/∂apply(x)`, with the bounds taken from `x` itself
    pub fn backward(&self, x: &DMatrix<f64>, dl_ds: &DMatrix<f64>) -> DVector<f64> {
        if self.map.n_parameters() == 0 {
            return DVector::zeros(0);
        }
        if !self.rescale {
            return self.map.backward(x, dl_ds);
        }

        let z = self.map.forward(x);
        let mut dl_dz = DMatrix::zeros(z.nrows(), z.ncols());
        for (p, col) in z.column_iter().enumerate() {
            let (i_min, lower) = col.argmin();
            let (i_max, upper) = col.argmax();
            let range = upper - lower;
            if range <= 0.0 {
                continue;
            }
            let r2 = range * range;
            let mut d_lower = 0.0;
            let mut d_upper = 0.0;
            for i in 0..z.nrows() {
                let g = dl_ds[(i, p)];
                dl_dz[(i, p)] += 2.0 * g / range;
                d_lower += g * 2.0 * (z[(i, p)] - upper) / r2;
                d_upper -= g * 2.0 * (z[(i, p)] - lower) / r2;
            }
            dl_dz[(i_min, p)] += d_lower;
            dl_dz[(i_max, p)] += d_upper;
        }
        self.map.backward(x, &dl_dz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn network() -> Mlp {
        let mut rng = SmallRng::seed_from_u64(7);
        Mlp::new(2, &[4, 3], 2, Activation::Tanh, &mut rng).expect("valid sizes")
    }

    fn inputs() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            4,
            2,
            &[0.1, -0.3, 0.5, 0.2, -0.4, 0.9, 0.8, -0.7],
        )
    }

    fn weighting() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            4,
            2,
            &[0.3, -1.2, 0.5, 0.7, 0.1, -0.4, 2.0, 0.6],
        )
    }

    fn check_backward<L>(params: &DVector<f64>, grad: &DVector<f64>, loss: L)
    where
        L: Fn(&[f64]) -> f64,
    {
        let h = 1E-6;
        for k in 0..params.len() {
            let mut up = params.clone();
            up[k] += h;
            let mut down = params.clone();
            down[k] -= h;
            let fd = (loss(up.as_slice()) - loss(down.as_slice())) / (2.0 * h);
            assert::close(grad[k], fd, 1E-6);
        }
    }

    #[test]
    fn mlp_shapes() {
        let mlp = network();
        assert_eq!(mlp.layers().len(), 3);
        assert_eq!(mlp.n_parameters(), (2 * 4 + 4) + (4 * 3 + 3) + (3 * 2 + 2));
        assert_eq!(mlp.input_dim(), Some(2));
        assert_eq!(mlp.output_dim(2), 2);
        assert_eq!(mlp.forward(&inputs()).shape(), (4, 2));
    }

    #[test]
    fn mlp_parameters_round_trip() -> Result<()> {
        let mlp = network();
        let again = mlp.reparameterize(mlp.parameters().as_slice())?;
        assert_eq!(again, mlp);
        assert!(mlp.reparameterize(&[0.0]).is_err());
        Ok(())
    }

    #[test]
    fn mlp_backward_matches_finite_differences() {
        let mlp = network();
        let x = inputs();
        let w = weighting();
        let grad = mlp.backward(&x, &w);
        check_backward(&mlp.parameters(), &grad, |p| {
            mlp.reparameterize(p)
                .map(|m| m.forward(&x).dot(&w))
                .unwrap_or(f64::NAN)
        });
    }

    #[test]
    fn rescaled_backward_matches_finite_differences() {
        let transform = InputTransform::with_rescaling(network());
        let x = inputs();
        let w = weighting();
        let grad = transform.backward(&x, &w);
        check_backward(&transform.parameters(), &grad, |p| {
            transform
                .reparameterize(p)
                .map(|t| t.apply(&x).dot(&w))
                .unwrap_or(f64::NAN)
        });
    }

    #[test]
    fn rescaled_features_lie_in_unit_box() {
        let transform = InputTransform::with_rescaling(network());
        let s = transform.apply(&inputs());
        assert!(s.iter().all(|v| (-1.0 - 1E-12..=1.0 + 1E-12).contains(v)));
        for col in s.column_iter() {
            assert::close(col.min(), -1.0, 1E-12);
            assert::close(col.max(), 1.0, 1E-12);
        }
    }

    #[test]
    fn frozen_bounds_ignore_the_query_batch() {
        let x = inputs();
        let mut transform = InputTransform::with_rescaling(network());
        transform.freeze(&x);

        // a single query point cannot be normalised by its own statistics
        let query = x.rows(1, 1).into_owned();
        let frozen = transform.apply(&query);
        let from_train = transform.apply(&x).rows(1, 1).into_owned();
        assert!(frozen.relative_eq(&from_train, 1E-12, 1E-12));

        transform.unfreeze();
        assert!(transform.apply(&query).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn identity_passes_through() {
        let transform = InputTransform::default();
        let x = inputs();
        assert_eq!(transform.apply(&x), x);
        assert_eq!(transform.n_parameters(), 0);
        assert_eq!(transform.backward(&x, &weighting()).len(), 0);
    }

    #[test]
    fn mismatched_layers_are_rejected() -> Result<()> {
        let a = Dense::new(DMatrix::zeros(3, 2), DVector::zeros(3), Activation::Relu)?;
        let b = Dense::new(DMatrix::zeros(1, 2), DVector::zeros(1), Activation::Linear)?;
        assert!(Mlp::from_layers(vec![a, b]).is_err());
        Ok(())
    }
}
