//! Pipelines that misbehave on purpose, for exercising trial isolation.
//!
//! Names follow `fault:<kind>[:<arg>]`, so a worker process can rebuild the
//! same pipeline from its name alone.

use am_types::{
    Configuration, Estimator, FeatureMatrix, Pipeline, Predictions, SearchSpace, TrialError,
};
use std::hint::black_box;
use std::thread;
use std::time::Duration;
use tracing::warn;

pub const FAULT_PREFIX: &str = "fault:";

/// How long a memory hog holds its allocation.
const HOG_HOLD: Duration = Duration::from_secs(30);
const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `fit` returns an error.
    Fail,
    /// `fit` panics.
    Panic,
    /// `fit` aborts the process.
    Abort,
    /// `fit` sleeps before succeeding.
    Sleep { millis: u64 },
    /// `fit` allocates and touches memory, then holds it.
    Hog { megabytes: usize },
}

impl Fault {
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(FAULT_PREFIX)?;
        let (kind, arg) = match rest.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg)),
            None => (rest, None),
        };
        match (kind, arg) {
            ("fail", None) => Some(Self::Fail),
            ("panic", None) => Some(Self::Panic),
            ("abort", None) => Some(Self::Abort),
            ("sleep", Some(ms)) => ms.parse().ok().map(|millis| Self::Sleep { millis }),
            ("hog", Some(mb)) => mb.parse().ok().map(|megabytes| Self::Hog { megabytes }),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Fail => format!("{FAULT_PREFIX}fail"),
            Self::Panic => format!("{FAULT_PREFIX}panic"),
            Self::Abort => format!("{FAULT_PREFIX}abort"),
            Self::Sleep { millis } => format!("{FAULT_PREFIX}sleep:{millis}"),
            Self::Hog { megabytes } => format!("{FAULT_PREFIX}hog:{megabytes}"),
        }
    }
}

/// Pipeline over a single `x` parameter whose estimator injects a fault.
#[derive(Debug, Clone)]
pub struct FaultPipeline {
    fault: Fault,
    name: String,
}

impl FaultPipeline {
    pub fn new(fault: Fault) -> Self {
        Self {
            name: fault.name(),
            fault,
        }
    }

    pub fn fault(&self) -> Fault {
        self.fault
    }
}

impl Pipeline for FaultPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn search_space(&self) -> SearchSpace {
        SearchSpace::new().add_float("x", 0.0, 1.0)
    }

    fn build(&self, configuration: &Configuration) -> Result<Box<dyn Estimator>, TrialError> {
        configuration.f64("x")?;
        Ok(Box::new(FaultEstimator {
            fault: self.fault,
            prior: Vec::new(),
        }))
    }
}

/// Predicts the training class prior once the fault has played out.
struct FaultEstimator {
    fault: Fault,
    prior: Vec<f64>,
}

impl Estimator for FaultEstimator {
    fn fit(
        &mut self,
        _features: &FeatureMatrix,
        labels: &[usize],
        n_classes: usize,
    ) -> Result<(), TrialError> {
        match self.fault {
            Fault::Fail => {
                return Err(TrialError::FitFailed {
                    message: "injected failure".into(),
                })
            }
            Fault::Panic => panic!("injected panic"),
            Fault::Abort => {
                warn!("Aborting worker on injected fault");
                std::process::abort();
            }
            Fault::Sleep { millis } => thread::sleep(Duration::from_millis(millis)),
            Fault::Hog { megabytes } => {
                let mut block = vec![0u8; megabytes * 1024 * 1024];
                for page in block.chunks_mut(PAGE_SIZE) {
                    page[0] = 1;
                }
                black_box(&block);
                thread::sleep(HOG_HOLD);
            }
        }

        let mut counts = vec![0.0; n_classes];
        for &label in labels {
            if let Some(count) = counts.get_mut(label) {
                *count += 1.0;
            }
        }
        let total = labels.len().max(1) as f64;
        self.prior = counts.into_iter().map(|c| c / total).collect();
        Ok(())
    }

    fn predict_proba(&self, features: &FeatureMatrix) -> Result<Predictions, TrialError> {
        if self.prior.is_empty() {
            return Err(TrialError::NotFitted);
        }
        Ok(Predictions::new(vec![self.prior.clone(); features.n_rows()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_types::{ParameterValue, TrialId};
    use std::collections::BTreeMap;

    fn config() -> Configuration {
        let mut values = BTreeMap::new();
        values.insert("x".to_string(), ParameterValue::Float(0.5));
        Configuration::new(TrialId(0), values, 0, 0)
    }

    #[test]
    fn names_round_trip() {
        for fault in [
            Fault::Fail,
            Fault::Panic,
            Fault::Abort,
            Fault::Sleep { millis: 250 },
            Fault::Hog { megabytes: 64 },
        ] {
            assert_eq!(Fault::parse(&fault.name()), Some(fault));
        }
        assert_eq!(Fault::parse("fault:sleep"), None);
        assert_eq!(Fault::parse("fault:fail:1"), None);
        assert_eq!(Fault::parse("classifier"), None);
    }

    #[test]
    fn sleep_fault_predicts_prior() {
        let pipeline = FaultPipeline::new(Fault::Sleep { millis: 1 });
        let mut estimator = pipeline.build(&config()).unwrap();
        let features = FeatureMatrix::numeric(vec![vec![0.0]; 4]).unwrap();
        estimator.fit(&features, &[0, 0, 0, 1], 2).unwrap();
        let predictions = estimator.predict_proba(&features).unwrap();
        assert_eq!(predictions.probabilities[0], vec![0.75, 0.25]);
    }

    #[test]
    fn fail_fault_returns_error() {
        let pipeline = FaultPipeline::new(Fault::Fail);
        let mut estimator = pipeline.build(&config()).unwrap();
        let features = FeatureMatrix::numeric(vec![vec![0.0]]).unwrap();
        assert!(matches!(
            estimator.fit(&features, &[0], 2),
            Err(TrialError::FitFailed { .. })
        ));
    }
}
