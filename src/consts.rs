//! Mathematical and numerical constants

/// 0.5 ln(2π)
pub const HALF_LN_2PI: f64 = 0.918_938_533_204_672_7;
/// 2π²
pub const TWO_PI_SQUARED: f64 = 19.739_208_802_178_716;

/// First diagonal jitter tried when a covariance matrix fails to factor
pub const DEFAULT_INITIAL_JITTER: f64 = 1E-6;
/// Number of jitter retries before giving up on a factorization
pub const DEFAULT_JITTER_TRIES: usize = 4;
/// Default number of standard deviations in a confidence region
pub const DEFAULT_N_STD: f64 = 2.0;
