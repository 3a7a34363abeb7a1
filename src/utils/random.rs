use num_traits::{Float, FromPrimitive};
use rand::Rng;

//////////////////////
// Gaussian sampler //
//////////////////////

/// Standard-normal sampler via the Marsaglia polar transform
///
/// The polar method produces two independent normal deviates per accepted
/// uniform pair; the second one is cached and handed out on the next call.
/// The cache lives in this struct so that two engines never share sampler
/// state.
///
/// ### Fields
///
/// * `cached` - The spare deviate from the previous accepted pair, if any
#[derive(Clone, Debug, Default)]
pub struct PolarGaussian<T> {
    cached: Option<T>,
}

impl<T> PolarGaussian<T>
where
    T: Float + FromPrimitive,
{
    /// Generate a new sampler with an empty cache
    pub fn new() -> Self {
        Self { cached: None }
    }

    /// Draw one standard-normal deviate
    ///
    /// Draws uniform pairs (u, v) ∈ [-1, 1]² from `rng` until
    /// r = u² + v² falls in (0, 1], then returns u·√(-2 ln r / r) and caches
    /// v·√(-2 ln r / r) for the next call.
    ///
    /// ### Params
    ///
    /// * `rng` - Uniform-in-[0,1) source
    ///
    /// ### Returns
    ///
    /// A sample from N(0, 1)
    pub fn sample<R: Rng>(&mut self, rng: &mut R) -> T {
        if let Some(spare) = self.cached.take() {
            return spare;
        }

        let one = T::one();
        let two = T::from_f64(2.0).unwrap();

        loop {
            let u = two * T::from_f64(rng.random::<f64>()).unwrap() - one;
            let v = two * T::from_f64(rng.random::<f64>()).unwrap() - one;
            let r = u * u + v * v;

            if r > T::zero() && r <= one {
                let scale = (-two * r.ln() / r).sqrt();
                self.cached = Some(v * scale);
                return u * scale;
            }
        }
    }

    /// Draw from N(mu, sigma²)
    ///
    /// ### Params
    ///
    /// * `rng` - Uniform-in-[0,1) source
    /// * `mu` - Mean
    /// * `sigma` - Standard deviation
    ///
    /// ### Returns
    ///
    /// A sample from N(mu, sigma²)
    pub fn randn<R: Rng>(&mut self, rng: &mut R, mu: T, sigma: T) -> T {
        mu + sigma * self.sample(rng)
    }
}

///////////
// Tests //
///////////
