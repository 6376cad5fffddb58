//! Seeding of every random source a generation session draws from.

use candle_core::Device;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::error::Result;

/// Host RNG for categorical draws: seeded when `seed` is given, from entropy otherwise.
#[must_use]
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Seed the accelerator-side RNG of `device` and return a host RNG seeded the same way.
///
/// The CPU device has no seedable generator of its own, so only CUDA/Metal devices are
/// touched. Same seed and inputs give the same token sequence.
///
/// # Errors
/// Returns an error if the device rejects the seed.
pub fn seed_everything(seed: u64, device: &Device) -> Result<StdRng> {
    if !device.is_cpu() {
        device.set_seed(seed)?;
    }
    tracing::debug!(seed, ?device, "seeded random sources");
    Ok(StdRng::seed_from_u64(seed))
}
