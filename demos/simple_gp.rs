use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use exact_gp::kernel::KernelExpr;
use exact_gp::mean::ConstantMean;
use exact_gp::model::{ExactGp, ExactGpParams, PredictOptions};
use exact_gp::train::{OptimizerKind, Trainer, TrainingConfig};

pub fn main() {
    env_logger::builder().init();
    let mut rng = SmallRng::seed_from_u64(0xABCD);

    // 11 points in [0, 1] of a noisy sine
    let noise = Normal::new(0.0, 0.2).expect("valid noise");
    let xs: DMatrix<f64> = DMatrix::from_fn(11, 1, |i, _| i as f64 / 10.0);
    let ys: DVector<f64> = DVector::from_fn(11, |i, _| {
        (2.0 * std::f64::consts::PI * xs[i]).sin() + noise.sample(&mut rng)
    });

    let kernel = KernelExpr::scaled_rbf(1.0, 1.0).expect("valid kernel");
    let mut gp = ExactGp::new(
        xs,
        ys,
        kernel,
        ConstantMean::default(),
        ExactGpParams::default(),
    )
    .expect("Data is valid so this should succeed");

    let config = TrainingConfig::default()
        .with_optimizer(OptimizerKind::Adam { learning_rate: 0.1 })
        .with_iterations(50);
    let report = Trainer::new(config)
        .fit(&mut gp)
        .expect("Training should succeed");

    for record in &report.records {
        println!(
            "Iter {:>2}/50 - Loss: {:.3} {:?}",
            record.iteration + 1,
            record.loss,
            record.hyperparameters
        );
    }

    gp.eval();
    let x_star = DMatrix::from_fn(51, 1, |i, _| i as f64 / 50.0);
    let pred = gp
        .predict(&x_star, PredictOptions::default().with_fast_variance(true))
        .expect("Prediction should succeed");
    let (lower, upper) = pred.confidence_region();

    println!("x,mean,lower,upper");
    for i in 0..x_star.nrows() {
        println!(
            "{:.2},{:.4},{:.4},{:.4}",
            x_star[i],
            pred.mean()[i],
            lower[i],
            upper[i]
        );
    }
}
