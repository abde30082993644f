use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};

use exact_gp::config::{FeatureExtractorConfig, GpConfig, MeanFamily};
use exact_gp::model::Mode;
use exact_gp::train::OptimizerKind;
use exact_gp::transform::Activation;

/// Mean squared error and mean absolute error of `pred` against `truth`
fn errors(pred: &DVector<f64>, truth: &DVector<f64>) -> (f64, f64) {
    let n = pred.len() as f64;
    let diff = pred - truth;
    (diff.norm_squared() / n, diff.abs().sum() / n)
}

fn target(x: &DMatrix<f64>, i: usize) -> f64 {
    (3.0 * x[(i, 0)]).sin() * x[(i, 1)] + 0.5 * x[(i, 2)].powi(2)
}

pub fn main() {
    env_logger::builder().init();
    let mut rng = StdRng::seed_from_u64(0xDEE9);
    let unif = Uniform::new(-1.0, 1.0);
    let noise = Normal::new(0.0, 0.05).expect("valid noise");

    let n_train = 80;
    let n_test = 40;
    let x_train = DMatrix::from_fn(n_train, 3, |_, _| unif.sample(&mut rng));
    let y_train = DVector::from_fn(n_train, |i, _| {
        target(&x_train, i) + noise.sample(&mut rng)
    });
    let x_test = DMatrix::from_fn(n_test, 3, |_, _| unif.sample(&mut rng));
    let y_test = DVector::from_fn(n_test, |i, _| target(&x_test, i));

    let config = GpConfig {
        feature_extractor: Some(FeatureExtractorConfig {
            hidden: vec![16, 8],
            output_dim: 2,
            activation: Activation::Relu,
        }),
        mean: MeanFamily::Constant(0.0),
        optimizer: OptimizerKind::Adam { learning_rate: 0.01 },
        iterations: 60,
        fast_variance: true,
        ..GpConfig::default()
    };

    let mut gp = config
        .build(x_train, y_train, &mut rng)
        .expect("Data is valid so this should succeed");

    let report = config
        .trainer()
        .with_stop_condition(|record| {
            if record.iteration % 10 == 0 {
                println!("Iter {:>3} - Loss: {:.3}", record.iteration, record.loss);
            }
            false
        })
        .fit(&mut gp)
        .expect("Training should succeed");
    println!("Final loss: {:?}", report.final_loss());

    gp.eval();
    assert_eq!(gp.mode(), Mode::Evaluation);
    let pred = gp
        .predict(&x_test, config.predict_options())
        .expect("Prediction should succeed");

    let (mse, mae) = errors(pred.mean(), &y_test);
    println!("Test MSE: {mse:.4}, MAE: {mae:.4}");
    if let Some(bounds) = gp.transform().frozen_bounds() {
        println!(
            "Feature bounds frozen from training: lower = {}, upper = {}",
            bounds.lower().transpose(),
            bounds.upper().transpose()
        );
    }
}
