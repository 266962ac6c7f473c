//! Named, independently seeded random streams for one simulation run.
//!
//! Every stochastic subsystem draws from its own stream so that, for
//! example, enabling failures does not shift the process-time samples of
//! an otherwise identical run.

use super::types::{clamp_duration, SimTime};
use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, Normal};
use serde::{Deserialize, Serialize};

/// Golden-ratio increment used to spread stream seeds apart
const STREAM_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// The stochastic subsystems that own a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RngStream {
    Arrivals,
    ProcessTime,
    Failures,
    Rework,
}

impl RngStream {
    pub const ALL: [RngStream; 4] = [
        RngStream::Arrivals,
        RngStream::ProcessTime,
        RngStream::Failures,
        RngStream::Rework,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RngStream::Arrivals => "arrivals",
            RngStream::ProcessTime => "process_time",
            RngStream::Failures => "failures",
            RngStream::Rework => "rework",
        }
    }

    fn index(&self) -> u64 {
        match self {
            RngStream::Arrivals => 0,
            RngStream::ProcessTime => 1,
            RngStream::Failures => 2,
            RngStream::Rework => 3,
        }
    }

    /// Seed of this stream for a given run seed
    pub fn derive_seed(&self, run_seed: u64) -> u64 {
        run_seed.wrapping_add((self.index() + 1).wrapping_mul(STREAM_SEED_STRIDE))
    }
}

/// Identifier of a derived stream, recorded in the run manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamId {
    pub name: String,
    pub seed: u64,
}

/// Derive the stream identifiers for a run seed
pub fn derive_stream_ids(run_seed: u64) -> Vec<StreamId> {
    RngStream::ALL
        .iter()
        .map(|stream| StreamId {
            name: stream.name().to_string(),
            seed: stream.derive_seed(run_seed),
        })
        .collect()
}

/// RNG context owned by a single run and passed by reference to each subsystem
#[derive(Debug, Clone)]
pub struct RngContext {
    seed: u64,
    arrivals: StdRng,
    process_time: StdRng,
    failures: StdRng,
    rework: StdRng,
}

impl RngContext {
    /// Create the four sub-streams for a run seed (`seed_base + scenario_index`)
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            arrivals: StdRng::seed_from_u64(RngStream::Arrivals.derive_seed(seed)),
            process_time: StdRng::seed_from_u64(RngStream::ProcessTime.derive_seed(seed)),
            failures: StdRng::seed_from_u64(RngStream::Failures.derive_seed(seed)),
            rework: StdRng::seed_from_u64(RngStream::Rework.derive_seed(seed)),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn stream_mut(&mut self, stream: RngStream) -> &mut StdRng {
        match stream {
            RngStream::Arrivals => &mut self.arrivals,
            RngStream::ProcessTime => &mut self.process_time,
            RngStream::Failures => &mut self.failures,
            RngStream::Rework => &mut self.rework,
        }
    }

    /// Uniform draw in [0, 1)
    pub fn uniform(&mut self, stream: RngStream) -> f64 {
        self.stream_mut(stream).gen::<f64>()
    }

    /// True with probability `p`
    pub fn bernoulli(&mut self, stream: RngStream, p: f64) -> bool {
        if p <= 0.0 {
            // Still consume a draw so the stream position does not depend on p.
            let _ = self.uniform(stream);
            return false;
        }
        self.uniform(stream) < p
    }

    /// Exponential draw with the given mean
    pub fn exponential(&mut self, stream: RngStream, mean: f64) -> SimTime {
        match Exp::new(1.0 / mean) {
            Ok(dist) => clamp_duration(dist.sample(self.stream_mut(stream))),
            Err(_) => {
                warn!("invalid exponential mean {}, using it as a fixed duration", mean);
                clamp_duration(mean)
            }
        }
    }

    /// Process time for one job-step: normal(mean, sd) truncated at zero
    pub fn process_time(&mut self, mean: SimTime, sd: SimTime) -> SimTime {
        let sample = match Normal::new(mean, sd) {
            Ok(dist) => dist.sample(&mut self.process_time),
            Err(_) => {
                warn!("invalid process time distribution ({}, {}), using mean", mean, sd);
                mean
            }
        };
        clamp_duration(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = RngContext::new(42);
        let mut b = RngContext::new(42);
        for _ in 0..16 {
            assert_eq!(
                a.uniform(RngStream::Failures).to_bits(),
                b.uniform(RngStream::Failures).to_bits()
            );
        }
    }

    #[test]
    fn test_streams_are_independent() {
        let mut a = RngContext::new(7);
        let mut b = RngContext::new(7);

        // Drawing heavily from one stream must not move another one.
        for _ in 0..100 {
            a.uniform(RngStream::Arrivals);
        }
        assert_eq!(
            a.uniform(RngStream::Rework).to_bits(),
            b.uniform(RngStream::Rework).to_bits()
        );
    }

    #[test]
    fn test_stream_ids_differ() {
        let ids = derive_stream_ids(1000);
        assert_eq!(ids.len(), 4);
        assert_eq!(ids[0].name, "arrivals");
        let mut seeds: Vec<u64> = ids.iter().map(|id| id.seed).collect();
        seeds.dedup();
        assert_eq!(seeds.len(), 4);
    }

    #[test]
    fn test_process_time_never_negative() {
        let mut rng = RngContext::new(3);
        for _ in 0..1000 {
            let sample = rng.process_time(0.1, 5.0);
            assert!(sample > 0.0);
        }
    }

    #[test]
    fn test_zero_sd_returns_mean() {
        let mut rng = RngContext::new(3);
        assert_eq!(rng.process_time(4.0, 0.0), 4.0);
    }

    #[test]
    fn test_exponential_mean_is_plausible() {
        let mut rng = RngContext::new(11);
        let n = 20_000;
        let total: f64 = (0..n).map(|_| rng.exponential(RngStream::Failures, 10.0)).sum();
        let mean = total / n as f64;
        assert!((mean - 10.0).abs() < 0.5, "sample mean {}", mean);
    }
}
