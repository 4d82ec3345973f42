//! Seeded random sampling over a declared search space.

use am_types::{
    flat_key, Configuration, ParameterKind, ParameterValue, SearchSpace, SpaceError, TrialId,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Source of candidate configurations for the scheduler.
pub trait Sampler: Send {
    /// Produce the next configuration in dispatch order.
    fn next_configuration(&mut self) -> Result<Configuration, SpaceError>;

    /// Human-readable sampler name.
    fn name(&self) -> &str;
}

/// Duplicate handling for [`RandomSampler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerOptions {
    /// Accept configurations identical to earlier ones.
    pub allow_duplicates: bool,
    /// Consecutive duplicate draws tolerated before the space counts as
    /// exhausted.
    pub max_sample_attempts: usize,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            allow_duplicates: false,
            max_sample_attempts: 50,
        }
    }
}

/// Independent uniform sampling across the search space.
///
/// Draw number `a` uses a ChaCha8 generator seeded with `seed` on stream `a`,
/// so the sequence depends only on `(seed, call count)` and any single draw
/// can be regenerated with [`RandomSampler::sample_stream`].
#[derive(Debug, Clone)]
pub struct RandomSampler {
    space: SearchSpace,
    seed: u64,
    options: SamplerOptions,
    attempts: u64,
    produced: u64,
    seen: HashSet<String>,
}

impl RandomSampler {
    pub fn new(space: SearchSpace, seed: u64) -> Result<Self, SpaceError> {
        Self::with_options(space, seed, SamplerOptions::default())
    }

    pub fn with_options(
        space: SearchSpace,
        seed: u64,
        options: SamplerOptions,
    ) -> Result<Self, SpaceError> {
        space.validate()?;
        Ok(Self {
            space,
            seed,
            options,
            attempts: 0,
            produced: 0,
            seen: HashSet::new(),
        })
    }

    /// Values drawn on one stream, independent of sampler state.
    pub fn sample_stream(&self, stream: u64) -> BTreeMap<String, ParameterValue> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(stream);
        let mut values = BTreeMap::new();
        sample_space(&self.space, &mut rng, None, &mut values);
        values
    }

    /// Draws taken so far, including rejected duplicates.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Configurations handed out so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }
}

impl Sampler for RandomSampler {
    fn next_configuration(&mut self) -> Result<Configuration, SpaceError> {
        let mut duplicates = 0;
        loop {
            if duplicates >= self.options.max_sample_attempts.max(1) {
                return Err(SpaceError::Exhausted {
                    attempts: duplicates,
                });
            }

            let stream = self.attempts;
            self.attempts += 1;
            let values = self.sample_stream(stream);
            let config = Configuration::new(TrialId(self.produced), values, self.seed, stream);

            if !self.options.allow_duplicates && !self.seen.insert(config.fingerprint()) {
                duplicates += 1;
                continue;
            }

            self.produced += 1;
            return Ok(config);
        }
    }

    fn name(&self) -> &str {
        "random"
    }
}

fn sample_space(
    space: &SearchSpace,
    rng: &mut ChaCha8Rng,
    prefix: Option<&str>,
    out: &mut BTreeMap<String, ParameterValue>,
) {
    for param in &space.parameters {
        let key = flat_key(prefix, &param.name);
        let value = match &param.kind {
            ParameterKind::FloatRange { low, high } => {
                ParameterValue::Float(uniform(rng, *low, *high))
            }
            ParameterKind::IntRange { low, high } => {
                ParameterValue::Int(rng.random_range(*low..=*high))
            }
            ParameterKind::LogUniform { low, high } => {
                let log_val = uniform(rng, low.ln(), high.ln());
                ParameterValue::Float(log_val.exp().clamp(*low, *high))
            }
            ParameterKind::Choice { values } => {
                let idx = rng.random_range(0..values.len());
                ParameterValue::Json(values[idx].clone())
            }
            ParameterKind::Nested { options } => {
                let option = &options[rng.random_range(0..options.len())];
                // The option's sub-space gets its own generator so that adding
                // parameters to one branch leaves sibling draws unchanged.
                let sub_seed: u64 = rng.random();
                let mut sub_rng = ChaCha8Rng::seed_from_u64(sub_seed);
                let nested_prefix = flat_key(Some(&key), &option.name);
                sample_space(&option.space, &mut sub_rng, Some(&nested_prefix), out);
                ParameterValue::Json(serde_json::Value::String(option.name.clone()))
            }
        };
        out.insert(key, value);
    }
}

fn uniform(rng: &mut ChaCha8Rng, low: f64, high: f64) -> f64 {
    if low == high {
        low
    } else {
        rng.random_range(low..=high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_space_def() -> SearchSpace {
        SearchSpace::new()
            .add_int("k", 5, 15)
            .add_float("subsample", 0.5, 1.0)
            .add_log_uniform("lr", 1e-5, 1e-1)
            .add_choice("imputer", vec![json!("mean"), json!("median")])
    }

    fn draw(sampler: &mut RandomSampler, n: usize) -> Vec<Configuration> {
        (0..n).map(|_| sampler.next_configuration().unwrap()).collect()
    }

    #[test]
    fn random_sampling_respects_bounds() {
        let mut sampler = RandomSampler::new(sample_space_def(), 11).unwrap();
        for config in draw(&mut sampler, 100) {
            let k = config.i64("k").unwrap();
            assert!((5..=15).contains(&k));
            let subsample = config.f64("subsample").unwrap();
            assert!((0.5..=1.0).contains(&subsample));
            let lr = config.f64("lr").unwrap();
            assert!((1e-5..=1e-1).contains(&lr), "lr out of bounds: {lr}");
            assert!(["mean", "median"].contains(&config.str("imputer").unwrap()));
        }
    }

    #[test]
    fn same_seed_replays_same_sequence() {
        let mut a = RandomSampler::new(sample_space_def(), 42).unwrap();
        let mut b = RandomSampler::new(sample_space_def(), 42).unwrap();
        assert_eq!(draw(&mut a, 20), draw(&mut b, 20));

        let mut c = RandomSampler::new(sample_space_def(), 43).unwrap();
        assert_ne!(draw(&mut a, 5), draw(&mut c, 5));
    }

    #[test]
    fn trial_ids_follow_dispatch_order() {
        let mut sampler = RandomSampler::new(sample_space_def(), 0).unwrap();
        let ids: Vec<u64> = draw(&mut sampler, 4).iter().map(|c| c.trial_id.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn any_configuration_can_be_regenerated_from_its_stream() {
        let mut sampler = RandomSampler::new(sample_space_def(), 5).unwrap();
        let configs = draw(&mut sampler, 10);
        let replay = RandomSampler::new(sample_space_def(), 5).unwrap();
        for config in configs {
            assert_eq!(config.seed, 5);
            assert_eq!(replay.sample_stream(config.stream), config.values);
        }
    }

    #[test]
    fn nested_space_samples_only_the_chosen_branch() {
        let space = SearchSpace::new().add_nested(
            "classifier",
            vec![
                ("knn", SearchSpace::new().add_int("k", 1, 25)),
                ("logistic", SearchSpace::new().add_float("c", 0.1, 10.0)),
            ],
        );
        let mut sampler = RandomSampler::new(space, 3).unwrap();
        let mut seen = HashSet::new();
        for config in draw(&mut sampler, 50) {
            let branch = config.str("classifier").unwrap().to_string();
            match branch.as_str() {
                "knn" => {
                    assert!(config.get("classifier:knn:k").is_some());
                    assert!(config.get("classifier:logistic:c").is_none());
                }
                "logistic" => {
                    assert!(config.get("classifier:logistic:c").is_some());
                    assert!(config.get("classifier:knn:k").is_none());
                }
                other => panic!("unexpected branch {other}"),
            }
            seen.insert(branch);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn duplicates_are_redrawn_until_exhausted() {
        let space = SearchSpace::new().add_choice("flag", vec![json!(true), json!(false)]);
        let mut sampler = RandomSampler::new(space, 9).unwrap();
        let first = sampler.next_configuration().unwrap();
        let second = sampler.next_configuration().unwrap();
        assert_ne!(first.values, second.values);

        assert!(matches!(
            sampler.next_configuration(),
            Err(SpaceError::Exhausted { attempts: 50 })
        ));
        assert_eq!(sampler.produced(), 2);
    }

    #[test]
    fn duplicates_can_be_allowed() {
        let space = SearchSpace::new().add_choice("flag", vec![json!(true)]);
        let options = SamplerOptions {
            allow_duplicates: true,
            ..SamplerOptions::default()
        };
        let mut sampler = RandomSampler::with_options(space, 1, options).unwrap();
        assert_eq!(draw(&mut sampler, 5).len(), 5);
    }

    #[test]
    fn empty_space_yields_one_configuration() {
        let mut sampler = RandomSampler::new(SearchSpace::new(), 1).unwrap();
        assert!(sampler.next_configuration().unwrap().values.is_empty());
        assert!(sampler.next_configuration().is_err());
    }

    #[test]
    fn invalid_space_is_rejected_up_front() {
        let space = SearchSpace::new().add_choice("strategy", vec![]);
        assert!(RandomSampler::new(space, 0).is_err());
    }
}
