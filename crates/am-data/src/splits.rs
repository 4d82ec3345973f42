//! Outer train/test folds for benchmark runs.

use am_types::{stratified_folds, validation_error, AmResult, LabeledSplit};

use crate::loaders::Dataset;

/// Train and test halves of one outer fold.
#[derive(Debug, Clone, PartialEq)]
pub struct OuterFold {
    pub fold: usize,
    pub train: LabeledSplit,
    pub test: LabeledSplit,
}

/// Stratified outer folds over a dataset. The assignment depends only on
/// `split_seed`, so every method and inner seed sees the same test rows for
/// a given fold.
#[derive(Debug, Clone)]
pub struct OuterFolds {
    folds: Vec<Vec<usize>>,
}

impl OuterFolds {
    pub fn new(dataset: &Dataset, n_folds: usize, split_seed: u64) -> AmResult<Self> {
        if n_folds < 2 {
            return Err(validation_error!("need at least 2 outer folds, got {n_folds}"));
        }
        if n_folds > dataset.n_rows() {
            return Err(validation_error!(
                "{n_folds} outer folds for {} rows",
                dataset.n_rows()
            ));
        }
        Ok(Self {
            folds: stratified_folds(&dataset.labels, n_folds, split_seed),
        })
    }

    pub fn len(&self) -> usize {
        self.folds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folds.is_empty()
    }

    /// Fold `fold` is the test split; all other rows train.
    pub fn split(&self, dataset: &Dataset, fold: usize) -> AmResult<OuterFold> {
        let test_indices = self.folds.get(fold).ok_or_else(|| {
            validation_error!("fold {fold} out of range for {} folds", self.folds.len())
        })?;
        let train_indices: Vec<usize> = self
            .folds
            .iter()
            .enumerate()
            .filter(|(f, _)| *f != fold)
            .flat_map(|(_, indices)| indices.iter().copied())
            .collect();

        let all = dataset.split()?;
        Ok(OuterFold {
            fold,
            train: all.subset(&train_indices),
            test: all.subset(test_indices),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{make_classification, SyntheticSpec};

    fn dataset() -> Dataset {
        make_classification(&SyntheticSpec {
            n_samples: 100,
            ..SyntheticSpec::default()
        })
        .unwrap()
    }

    #[test]
    fn folds_partition_the_rows() {
        let data = dataset();
        let folds = OuterFolds::new(&data, 10, 42).unwrap();
        let mut seen = vec![0; data.n_rows()];
        for f in 0..folds.len() {
            let outer = folds.split(&data, f).unwrap();
            assert_eq!(outer.train.len() + outer.test.len(), data.n_rows());
            assert_eq!(outer.test.len(), 10);
        }
        for fold in &folds.folds {
            for &i in fold {
                seen[i] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1));
    }

    #[test]
    fn out_of_range_fold_is_rejected() {
        let data = dataset();
        let folds = OuterFolds::new(&data, 5, 0).unwrap();
        assert!(folds.split(&data, 5).is_err());
        assert!(OuterFolds::new(&data, 1, 0).is_err());
    }
}
