use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;

use exact_gp::config::{GpConfig, KernelFamily, MeanFamily};
use exact_gp::train::OptimizerKind;

pub fn main() {
    env_logger::builder().init();
    let mut rng = StdRng::seed_from_u64(0x1234);

    // 15 points of a sine with period 1.5 on [0, 4]
    let xs: DMatrix<f64> = DMatrix::from_fn(15, 1, |i, _| 4.0 * i as f64 / 14.0);
    let ys: DVector<f64> = xs
        .column(0)
        .map(|x| (2.0 * std::f64::consts::PI * x / 1.5).sin());

    let config = GpConfig {
        kernel: KernelFamily::SpectralMixture {
            num_mixtures: 4,
            from_data: true,
        },
        mean: MeanFamily::Constant(0.0),
        optimizer: OptimizerKind::Adam { learning_rate: 0.1 },
        iterations: 100,
        fast_variance: true,
        ..GpConfig::default()
    };

    let mut gp = config
        .build(xs, ys, &mut rng)
        .expect("Data is valid so this should succeed");
    println!("Initial kernel = {:#?}", gp.kernel());

    let report = config
        .trainer()
        .fit(&mut gp)
        .expect("Training should succeed");
    println!(
        "Loss {:?} -> {:?} over {} iterations",
        report.initial_loss(),
        report.final_loss(),
        report.n_iterations()
    );
    println!("Optimized kernel = {:#?}", gp.kernel());

    // extrapolate past the training range
    gp.eval();
    let x_star = DMatrix::from_fn(26, 1, |i, _| 5.0 * i as f64 / 25.0);
    let pred = gp
        .predict(&x_star, config.predict_options())
        .expect("Prediction should succeed");
    let (lower, upper) = pred
        .confidence_region_with(config.n_std)
        .expect("n_std is valid");

    for i in 0..x_star.nrows() {
        println!(
            "x = {:.2}: {:.3} in [{:.3}, {:.3}]",
            x_star[i],
            pred.mean()[i],
            lower[i],
            upper[i]
        );
    }

    let draws: Vec<DVector<f64>> = pred
        .sample_stream(&mut rng)
        .expect("Posterior covariance factors")
        .take(3)
        .collect();
    println!("3 posterior draws at x = 5: {:?}", draws.iter().map(|d| d[25]).collect::<Vec<_>>());
}
