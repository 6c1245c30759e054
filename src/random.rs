//! Random number streams and distributions.
//!
//! The engine binds the PCG-64 DXSM bit generator ([`rand_pcg::Pcg64Dxsm`])
//! and derives independent streams from a single 128-bit base seed by jumped
//! advancement: stream `s` of replication `r` starts from the base state
//! advanced by `(r * streams_per_run + s)` strides of 2^64 steps. With a
//! generator period of 2^128 this leaves every stream 2^64 samples of
//! headroom, and makes every `(replication, stream)` pair fully reproducible
//! from the base seed alone.
//!
//! Model code samples through [`SimDistribution`], a validated distribution
//! descriptor, usually paired with a stream in a [`TimeSampler`]:
//!
//! ```
//! use simproc::random::{SimDistribution, StreamId, TimeSampler};
//! use simproc::time::TimeUnit;
//!
//! let interarrival = TimeSampler::new(
//!     SimDistribution::exponential(10.0).unwrap(),
//!     StreamId(1),
//!     Some(TimeUnit::Minutes),
//! );
//! ```

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use rand::Rng;
use rand_distr::Distribution;
use rand_pcg::Pcg64Dxsm;

use crate::time::{SimTime, TimeUnit};

/// Base seed shared by all replications.
///
/// Replications never reuse this state directly; they advance it by a
/// replication- and stream-dependent jump first.
pub const BASE_SEED: u128 = 339697402671268427564149969060011333618;

/// Stream selector increment for the underlying LCG. Any odd constant works;
/// this one is the classic MCG increment.
const STREAM_INCREMENT: u128 = 1442695040888963407;

/// Jump stride between consecutive streams, in generator steps.
const STREAM_STRIDE: u128 = 1 << 64;

/// Identifier of a random number stream within a replication.
///
/// Streams are integer-indexed from zero up to the configured
/// `streams_per_run` (exclusive).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned for out-of-domain distribution parameters or an invalid
/// stream index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RandomError(String);

impl RandomError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for RandomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "random error: {}", self.0)
    }
}

impl Error for RandomError {}

/// The set of random number streams of one replication.
///
/// Streams are created lazily on first use; a stream that is never sampled
/// costs nothing.
pub(crate) struct RandomStreams {
    run_index: u32,
    streams_per_run: u32,
    rngs: HashMap<u32, Pcg64Dxsm>,
}

impl RandomStreams {
    /// Creates the stream set for the specified replication.
    pub(crate) fn new(run_index: u32, streams_per_run: u32) -> Self {
        Self {
            run_index,
            streams_per_run,
            rngs: HashMap::new(),
        }
    }

    /// Returns the generator for a stream, creating it on first use.
    pub(crate) fn rng(&mut self, stream: StreamId) -> Result<&mut Pcg64Dxsm, RandomError> {
        if stream.0 >= self.streams_per_run {
            return Err(RandomError::new(format!(
                "stream index {} exceeds the configured streams-per-run limit ({})",
                stream.0, self.streams_per_run
            )));
        }
        let run_index = self.run_index;
        let streams_per_run = self.streams_per_run;
        Ok(self.rngs.entry(stream.0).or_insert_with(|| {
            let mut rng = Pcg64Dxsm::new(BASE_SEED, STREAM_INCREMENT);
            let jumps = run_index as u128 * streams_per_run as u128 + stream.0 as u128;
            rng.advance(jumps.wrapping_mul(STREAM_STRIDE));
            rng
        }))
    }

    /// Samples a distribution from the specified stream.
    pub(crate) fn sample(
        &mut self,
        dist: &SimDistribution,
        stream: StreamId,
    ) -> Result<f64, RandomError> {
        let rng = self.rng(stream)?;
        Ok(dist.sample_with(rng))
    }
}

/// A validated distribution descriptor.
///
/// Every constructor checks its parameter domain once, so sampling itself is
/// infallible. All continuous distributions sample `f64`; the discrete ones
/// (`binomial`, `geometric`) sample integers widened to `f64`.
#[derive(Clone, Debug, PartialEq)]
pub enum SimDistribution {
    /// Degenerate distribution returning a constant.
    Constant(f64),
    /// Uniform on `[low, high)`.
    Uniform { low: f64, high: f64 },
    /// Exponential with the given mean (not rate).
    Exponential { mean: f64 },
    /// Normal distribution.
    Normal { mean: f64, std_dev: f64 },
    /// Log-normal with the given location and scale of the underlying normal.
    LogNormal { mu: f64, sigma: f64 },
    /// Gamma distribution.
    Gamma { shape: f64, scale: f64 },
    /// Beta distribution on `[0, 1]`.
    Beta { alpha: f64, beta: f64 },
    /// Weibull distribution.
    Weibull { shape: f64, scale: f64 },
    /// Pareto distribution.
    Pareto { scale: f64, shape: f64 },
    /// Triangular distribution.
    Triangular { min: f64, mode: f64, max: f64 },
    /// Logistic distribution.
    Logistic { location: f64, scale: f64 },
    /// Wald (inverse Gaussian) distribution.
    Wald { mean: f64, shape: f64 },
    /// Binomial distribution over `n` trials.
    Binomial { n: u64, p: f64 },
    /// Geometric distribution (number of failures before the first success).
    Geometric { p: f64 },
}

impl SimDistribution {
    /// A constant pseudo-distribution.
    pub fn constant(value: f64) -> Result<Self, RandomError> {
        if !value.is_finite() {
            return Err(RandomError::new("constant value must be finite"));
        }
        Ok(Self::Constant(value))
    }

    /// Uniform on `[low, high)`.
    pub fn uniform(low: f64, high: f64) -> Result<Self, RandomError> {
        if !(low < high) || !low.is_finite() || !high.is_finite() {
            return Err(RandomError::new("uniform requires low < high"));
        }
        Ok(Self::Uniform { low, high })
    }

    /// Exponential with the given mean.
    pub fn exponential(mean: f64) -> Result<Self, RandomError> {
        if !(mean > 0.0 && mean.is_finite()) {
            return Err(RandomError::new("exponential mean must be > 0"));
        }
        Ok(Self::Exponential { mean })
    }

    /// Normal with the given mean and standard deviation.
    pub fn normal(mean: f64, std_dev: f64) -> Result<Self, RandomError> {
        if !(std_dev >= 0.0 && std_dev.is_finite()) || !mean.is_finite() {
            return Err(RandomError::new("normal std_dev must be >= 0"));
        }
        Ok(Self::Normal { mean, std_dev })
    }

    /// Log-normal parameterized by the underlying normal.
    pub fn lognormal(mu: f64, sigma: f64) -> Result<Self, RandomError> {
        if !(sigma >= 0.0 && sigma.is_finite()) || !mu.is_finite() {
            return Err(RandomError::new("lognormal sigma must be >= 0"));
        }
        Ok(Self::LogNormal { mu, sigma })
    }

    /// Gamma with the given shape and scale.
    pub fn gamma(shape: f64, scale: f64) -> Result<Self, RandomError> {
        if !(shape > 0.0 && scale > 0.0 && shape.is_finite() && scale.is_finite()) {
            return Err(RandomError::new("gamma shape and scale must be > 0"));
        }
        Ok(Self::Gamma { shape, scale })
    }

    /// Beta with the given shape parameters.
    pub fn beta(alpha: f64, beta: f64) -> Result<Self, RandomError> {
        if !(alpha > 0.0 && beta > 0.0 && alpha.is_finite() && beta.is_finite()) {
            return Err(RandomError::new("beta parameters must be > 0"));
        }
        Ok(Self::Beta { alpha, beta })
    }

    /// Weibull with the given shape and scale.
    pub fn weibull(shape: f64, scale: f64) -> Result<Self, RandomError> {
        if !(shape > 0.0 && scale > 0.0 && shape.is_finite() && scale.is_finite()) {
            return Err(RandomError::new("weibull shape and scale must be > 0"));
        }
        Ok(Self::Weibull { shape, scale })
    }

    /// Pareto with the given scale and shape.
    pub fn pareto(scale: f64, shape: f64) -> Result<Self, RandomError> {
        if !(scale > 0.0 && shape > 0.0 && scale.is_finite() && shape.is_finite()) {
            return Err(RandomError::new("pareto scale and shape must be > 0"));
        }
        Ok(Self::Pareto { scale, shape })
    }

    /// Triangular with the given bounds and mode.
    pub fn triangular(min: f64, mode: f64, max: f64) -> Result<Self, RandomError> {
        if !(min <= mode && mode <= max && min < max) || !min.is_finite() || !max.is_finite() {
            return Err(RandomError::new("triangular requires min <= mode <= max"));
        }
        Ok(Self::Triangular { min, mode, max })
    }

    /// Logistic with the given location and scale.
    pub fn logistic(location: f64, scale: f64) -> Result<Self, RandomError> {
        if !(scale > 0.0 && scale.is_finite()) || !location.is_finite() {
            return Err(RandomError::new("logistic scale must be > 0"));
        }
        Ok(Self::Logistic { location, scale })
    }

    /// Wald (inverse Gaussian) with the given mean and shape.
    pub fn wald(mean: f64, shape: f64) -> Result<Self, RandomError> {
        if !(mean > 0.0 && shape > 0.0 && mean.is_finite() && shape.is_finite()) {
            return Err(RandomError::new("wald mean and shape must be > 0"));
        }
        Ok(Self::Wald { mean, shape })
    }

    /// Binomial over `n` trials with success probability `p`.
    pub fn binomial(n: u64, p: f64) -> Result<Self, RandomError> {
        if !(0.0..=1.0).contains(&p) {
            return Err(RandomError::new("binomial p must be in [0, 1]"));
        }
        Ok(Self::Binomial { n, p })
    }

    /// Geometric with success probability `p`.
    pub fn geometric(p: f64) -> Result<Self, RandomError> {
        if !(p > 0.0 && p <= 1.0) {
            return Err(RandomError::new("geometric p must be in (0, 1]"));
        }
        Ok(Self::Geometric { p })
    }

    /// Draws one sample.
    ///
    /// The `rand_distr` samplers are rebuilt per draw; their construction
    /// cannot fail here because every parameter was validated upfront.
    fn sample_with(&self, rng: &mut Pcg64Dxsm) -> f64 {
        match *self {
            Self::Constant(v) => v,
            Self::Uniform { low, high } => rng.gen_range(low..high),
            Self::Exponential { mean } => {
                let d = rand_distr::Exp::new(1.0 / mean).expect("validated at construction");
                d.sample(rng)
            }
            Self::Normal { mean, std_dev } => {
                let d = rand_distr::Normal::new(mean, std_dev).expect("validated at construction");
                d.sample(rng)
            }
            Self::LogNormal { mu, sigma } => {
                let d = rand_distr::LogNormal::new(mu, sigma).expect("validated at construction");
                d.sample(rng)
            }
            Self::Gamma { shape, scale } => {
                let d = rand_distr::Gamma::new(shape, scale).expect("validated at construction");
                d.sample(rng)
            }
            Self::Beta { alpha, beta } => {
                let d = rand_distr::Beta::new(alpha, beta).expect("validated at construction");
                d.sample(rng)
            }
            Self::Weibull { shape, scale } => {
                let d = rand_distr::Weibull::new(scale, shape).expect("validated at construction");
                d.sample(rng)
            }
            Self::Pareto { scale, shape } => {
                let d = rand_distr::Pareto::new(scale, shape).expect("validated at construction");
                d.sample(rng)
            }
            Self::Triangular { min, mode, max } => {
                let d =
                    rand_distr::Triangular::new(min, max, mode).expect("validated at construction");
                d.sample(rng)
            }
            Self::Logistic { location, scale } => {
                // Inverse-CDF sampling; `rand_distr` has no logistic type.
                let u: f64 = rng.gen_range(f64::EPSILON..1.0);
                location + scale * (u / (1.0 - u)).ln()
            }
            Self::Wald { mean, shape } => {
                let d = rand_distr::InverseGaussian::new(mean, shape)
                    .expect("validated at construction");
                d.sample(rng)
            }
            Self::Binomial { n, p } => {
                let d = rand_distr::Binomial::new(n, p).expect("validated at construction");
                d.sample(rng) as f64
            }
            Self::Geometric { p } => {
                let d = rand_distr::Geometric::new(p).expect("validated at construction");
                d.sample(rng) as f64
            }
        }
    }
}

/// A distribution bound to a stream, producing [`SimTime`] samples.
///
/// This is the restartable lazy sample sequence used by sources, failure
/// agents and model code: each call to the owning context's sampling method
/// draws the next value from the stream.
#[derive(Clone, Debug)]
pub struct TimeSampler {
    dist: SimDistribution,
    stream: StreamId,
    unit: Option<TimeUnit>,
}

impl TimeSampler {
    /// Creates a sampler producing values tagged with `unit` (or
    /// dimensionless values if `None`).
    pub fn new(dist: SimDistribution, stream: StreamId, unit: Option<TimeUnit>) -> Self {
        Self { dist, stream, unit }
    }

    /// The stream this sampler draws from.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Draws the next sample as a [`SimTime`]. Negative draws (possible for
    /// e.g. the normal distribution) are clamped to zero, since simulated
    /// time intervals are non-negative.
    pub(crate) fn sample_time(&self, streams: &mut RandomStreams) -> Result<SimTime, RandomError> {
        let v = streams.sample(&self.dist, self.stream)?.max(0.0);
        Ok(match self.unit {
            Some(u) => SimTime::new(v, u),
            None => SimTime::none(v),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_are_reproducible() {
        let mut a = RandomStreams::new(3, 100);
        let mut b = RandomStreams::new(3, 100);
        let dist = SimDistribution::exponential(10.0).unwrap();

        let xs: Vec<f64> = (0..16).map(|_| a.sample(&dist, StreamId(7)).unwrap()).collect();
        let ys: Vec<f64> = (0..16).map(|_| b.sample(&dist, StreamId(7)).unwrap()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn streams_are_distinct_across_runs() {
        let mut a = RandomStreams::new(1, 100);
        let mut b = RandomStreams::new(2, 100);
        let dist = SimDistribution::uniform(0.0, 1.0).unwrap();

        let xs: Vec<f64> = (0..8).map(|_| a.sample(&dist, StreamId(0)).unwrap()).collect();
        let ys: Vec<f64> = (0..8).map(|_| b.sample(&dist, StreamId(0)).unwrap()).collect();
        assert_ne!(xs, ys);
    }

    #[test]
    fn stream_index_is_bounded() {
        let mut s = RandomStreams::new(0, 10);
        assert!(s.rng(StreamId(10)).is_err());
        assert!(s.rng(StreamId(9)).is_ok());
    }

    #[test]
    fn parameter_domains_are_validated() {
        assert!(SimDistribution::exponential(0.0).is_err());
        assert!(SimDistribution::uniform(1.0, 1.0).is_err());
        assert!(SimDistribution::triangular(0.0, 2.0, 1.0).is_err());
        assert!(SimDistribution::geometric(0.0).is_err());
        assert!(SimDistribution::wald(1.0, -1.0).is_err());
    }

    #[test]
    fn exponential_mean_is_plausible() {
        let mut s = RandomStreams::new(0, 10);
        let dist = SimDistribution::exponential(10.0).unwrap();
        let n = 20_000;
        let total: f64 = (0..n).map(|_| s.sample(&dist, StreamId(1)).unwrap()).sum();
        let mean = total / n as f64;
        assert!((mean - 10.0).abs() < 0.5, "sample mean {mean}");
    }
}
