pub mod telemetry;

pub use telemetry::*;

use rand::SeedableRng;
use rand::rngs::StdRng;
use uuid::Uuid;

/// Short opaque id threaded through telemetry for one optimization run.
pub fn correlation_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("tp-{}", &id[..12])
}

/// Default fan-out for parallel per-example work: twice the scheduler count.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}

/// Single explicit PRNG for the optimizers. Runs are reproducible when a
/// seed is supplied and the LM responses are fixed.
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Clamps a string to at most `max_chars` characters, counting characters
/// rather than bytes so multi-byte text never splits mid-codepoint.
pub fn clamp_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
