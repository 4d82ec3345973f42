//! # am-bench
//!
//! Experiment driver for Sweepline: runs the configured optimization for
//! every outer fold, dataset and feature method and stores the trial
//! histories as Parquet artifacts.

pub mod config;
pub mod runner;

pub use config::{ExperimentConfig, IsolationMode};
pub use runner::{BenchError, RunContext, RunOutcome, RunSummary};
