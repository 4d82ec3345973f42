//! Wire protocol between the scheduler and process-isolated trial workers.
//!
//! The parent spawns the worker program with [`WORKER_ENV`] set, writes one
//! JSON [`WorkerMessage`] line to its stdin and reads one JSON reply line from
//! its stdout: a [`CheckReply`] for a setup check, a [`WorkerReply`] for a
//! trial. Anything the worker logs must go to stderr.

use am_types::{Configuration, MetricDefinition, MetricInfo, Pipeline, TrialData, TrialId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::OptimizeError;
use crate::evaluator::{EvaluationPlan, TrialEvaluator};
use crate::trial::{Evaluation, FailureDetail, Outcome};

/// Set in the environment of every spawned worker.
pub const WORKER_ENV: &str = "AM_TRIAL_WORKER";

/// True when this process was spawned as a trial worker.
pub fn is_worker_invocation() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// Program used to start process-isolated trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Re-invoke the running executable.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub(crate) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).envs(&self.env).env(WORKER_ENV, "1");
        cmd
    }
}

/// One line written to a worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Confirm that the worker resolves both names. Sent once per run,
    /// before any trial is dispatched.
    Check { pipeline: String, metric: String },
    Trial(WorkerRequest),
}

/// Everything a worker needs to evaluate one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub trial_id: TrialId,
    /// Looked up by name in the worker's pipeline registry.
    pub pipeline: String,
    /// The scorer is looked up by name; the other settings are applied over it.
    pub metric: MetricInfo,
    pub configuration: Configuration,
    pub plan: EvaluationPlan,
    /// JSON-serialized [`TrialData`] shared by every trial of the run.
    pub data_path: PathBuf,
}

/// A worker's answer to [`WorkerMessage::Check`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReply {
    pub result: Result<(), String>,
}

/// A worker's answer for one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    pub trial_id: TrialId,
    pub result: Result<Evaluation, FailureDetail>,
}

impl WorkerReply {
    pub fn into_outcome(self) -> Outcome {
        match self.result {
            Ok(evaluation) => Outcome::Completed(evaluation),
            Err(detail) => Outcome::Failed(detail),
        }
    }
}

/// Serve one message from `input`, writing the reply to `output`.
///
/// Pipeline and metric names are resolved through the given lookups. Every
/// evaluation problem is reported in the reply; only protocol I/O errors are
/// returned.
pub fn serve<R, W, P, M>(
    mut input: R,
    mut output: W,
    resolve_pipeline: P,
    resolve_metric: M,
) -> Result<(), OptimizeError>
where
    R: BufRead,
    W: Write,
    P: Fn(&str) -> Option<Arc<dyn Pipeline>>,
    M: Fn(&str) -> Option<MetricDefinition>,
{
    let mut line = String::new();
    input.read_line(&mut line)?;
    let message: WorkerMessage = serde_json::from_str(line.trim())?;

    match message {
        WorkerMessage::Check { pipeline, metric } => {
            let result = resolve(&pipeline, &metric, &resolve_pipeline, &resolve_metric)
                .map(|_| ())
                .map_err(|failure| failure.message);
            debug!(%pipeline, %metric, ok = result.is_ok(), "Worker answered setup check");
            write_line(&mut output, &CheckReply { result })
        }
        WorkerMessage::Trial(request) => {
            debug!(trial = %request.trial_id, pipeline = %request.pipeline, "Worker received trial");
            let result = evaluate_request(&request, &resolve_pipeline, &resolve_metric);
            if let Err(failure) = &result {
                warn!(trial = %request.trial_id, %failure, "Trial failed in worker");
            }
            let reply = WorkerReply {
                trial_id: request.trial_id,
                result,
            };
            write_line(&mut output, &reply)
        }
    }
}

/// [`serve`] on the process's own stdin and stdout.
pub fn serve_stdio<P, M>(resolve_pipeline: P, resolve_metric: M) -> Result<(), OptimizeError>
where
    P: Fn(&str) -> Option<Arc<dyn Pipeline>>,
    M: Fn(&str) -> Option<MetricDefinition>,
{
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve(stdin.lock(), stdout.lock(), resolve_pipeline, resolve_metric)
}

fn write_line<W: Write, T: Serialize>(output: &mut W, value: &T) -> Result<(), OptimizeError> {
    serde_json::to_writer(&mut *output, value)?;
    output.write_all(b"\n")?;
    output.flush()?;
    Ok(())
}

fn resolve<P, M>(
    pipeline: &str,
    metric: &str,
    resolve_pipeline: &P,
    resolve_metric: &M,
) -> Result<(Arc<dyn Pipeline>, MetricDefinition), FailureDetail>
where
    P: Fn(&str) -> Option<Arc<dyn Pipeline>>,
    M: Fn(&str) -> Option<MetricDefinition>,
{
    let pipeline = resolve_pipeline(pipeline)
        .ok_or_else(|| FailureDetail::error(format!("unknown pipeline {pipeline}")))?;
    let scorer = resolve_metric(metric)
        .ok_or_else(|| FailureDetail::error(format!("unknown metric {metric}")))?;
    Ok((pipeline, scorer))
}

fn evaluate_request<P, M>(
    request: &WorkerRequest,
    resolve_pipeline: &P,
    resolve_metric: &M,
) -> Result<Evaluation, FailureDetail>
where
    P: Fn(&str) -> Option<Arc<dyn Pipeline>>,
    M: Fn(&str) -> Option<MetricDefinition>,
{
    let (pipeline, scorer) = resolve(
        &request.pipeline,
        &request.metric.name,
        resolve_pipeline,
        resolve_metric,
    )?;
    let metric = request.metric.with_scorer(&scorer);

    let file = File::open(&request.data_path).map_err(|e| {
        FailureDetail::error(format!(
            "cannot open trial data {}: {e}",
            request.data_path.display()
        ))
    })?;
    let data: TrialData = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| FailureDetail::error(format!("cannot read trial data: {e}")))?;

    let evaluator = TrialEvaluator::new(pipeline, metric, Arc::new(data), request.plan.clone())
        .map_err(|e| FailureDetail::error(e.to_string()))?;
    evaluator
        .evaluate(&request.configuration)
        .map_err(|e| FailureDetail::error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_types::{
        Estimator, FeatureMatrix, LabeledSplit, ParameterValue, Predictions, SearchSpace,
        TrialError,
    };
    use std::io::Cursor;

    struct AlwaysFirst;

    impl Estimator for AlwaysFirst {
        fn fit(&mut self, _: &FeatureMatrix, _: &[usize], _: usize) -> Result<(), TrialError> {
            Ok(())
        }

        fn predict_proba(&self, features: &FeatureMatrix) -> Result<Predictions, TrialError> {
            Ok(Predictions::new(vec![vec![0.9, 0.1]; features.n_rows()]))
        }
    }

    struct FirstClassPipeline;

    impl Pipeline for FirstClassPipeline {
        fn name(&self) -> &str {
            "first_class"
        }

        fn search_space(&self) -> SearchSpace {
            SearchSpace::new()
        }

        fn build(&self, _: &Configuration) -> Result<Box<dyn Estimator>, TrialError> {
            Ok(Box::new(AlwaysFirst))
        }
    }

    fn resolve_pipeline(name: &str) -> Option<Arc<dyn Pipeline>> {
        (name == "first_class").then(|| Arc::new(FirstClassPipeline) as Arc<dyn Pipeline>)
    }

    fn write_data() -> tempfile::NamedTempFile {
        let split = |labels: Vec<usize>| {
            let rows = labels.iter().map(|&y| vec![y as f64]).collect();
            LabeledSplit::new(FeatureMatrix::numeric(rows).unwrap(), labels).unwrap()
        };
        let data = TrialData::new(split(vec![0, 1, 0, 1]), 2)
            .with_validation(split(vec![0, 0, 0, 1]));
        let file = tempfile::NamedTempFile::new().unwrap();
        serde_json::to_writer(file.as_file(), &data).unwrap();
        file
    }

    fn trial(
        pipeline: &str,
        metric: MetricInfo,
        plan: EvaluationPlan,
        data_path: PathBuf,
    ) -> String {
        let mut values = BTreeMap::new();
        values.insert("k".to_string(), ParameterValue::Int(3));
        let message = WorkerMessage::Trial(WorkerRequest {
            trial_id: TrialId(7),
            pipeline: pipeline.to_string(),
            metric,
            configuration: Configuration::new(TrialId(7), values, 1, 7),
            plan,
            data_path,
        });
        format!("{}\n", serde_json::to_string(&message).unwrap())
    }

    fn request(pipeline: &str, data_path: PathBuf) -> String {
        trial(
            pipeline,
            MetricDefinition::accuracy().info(),
            EvaluationPlan::Holdout,
            data_path,
        )
    }

    fn serve_line(input: String) -> Vec<u8> {
        let mut output = Vec::new();
        serve(
            Cursor::new(input),
            &mut output,
            resolve_pipeline,
            MetricDefinition::builtin,
        )
        .unwrap();
        output
    }

    fn run(input: String) -> WorkerReply {
        serde_json::from_slice(&serve_line(input)).unwrap()
    }

    fn check(pipeline: &str, metric: &str) -> CheckReply {
        let message = WorkerMessage::Check {
            pipeline: pipeline.to_string(),
            metric: metric.to_string(),
        };
        let input = format!("{}\n", serde_json::to_string(&message).unwrap());
        serde_json::from_slice(&serve_line(input)).unwrap()
    }

    #[test]
    fn worker_evaluates_request() {
        let data = write_data();
        let reply = run(request("first_class", data.path().to_path_buf()));
        assert_eq!(reply.trial_id, TrialId(7));
        let evaluation = reply.result.unwrap();
        assert_eq!(evaluation.score, 0.75);
    }

    #[test]
    fn unknown_pipeline_is_reported_in_reply() {
        let data = write_data();
        let reply = run(request("missing", data.path().to_path_buf()));
        let failure = reply.result.unwrap_err();
        assert!(failure.message.contains("unknown pipeline missing"));
    }

    #[test]
    fn missing_data_file_is_reported_in_reply() {
        let reply = run(request("first_class", PathBuf::from("/nonexistent/data.json")));
        assert!(matches!(
            reply.into_outcome(),
            Outcome::Failed(FailureDetail { kind: crate::trial::FailureKind::Error, .. })
        ));
    }

    #[test]
    fn worker_applies_requested_aggregation() {
        // Three stratified folds over these labels score 2/3, 1/2 and 1/2.
        let split = |labels: Vec<usize>| {
            let rows = labels.iter().map(|&y| vec![y as f64]).collect();
            LabeledSplit::new(FeatureMatrix::numeric(rows).unwrap(), labels).unwrap()
        };
        let data = TrialData::new(split(vec![0, 0, 0, 0, 1, 1, 1]), 2);
        let file = tempfile::NamedTempFile::new().unwrap();
        serde_json::to_writer(file.as_file(), &data).unwrap();
        let plan = EvaluationPlan::CrossValidation { folds: 3, seed: 5 };

        let mean = MetricDefinition::accuracy().info();
        let reply = run(trial("first_class", mean, plan.clone(), file.path().to_path_buf()));
        let evaluation = reply.result.unwrap();
        assert!((evaluation.score - 5.0 / 9.0).abs() < 1e-12);

        let median = MetricDefinition::accuracy()
            .with_aggregation(am_types::Aggregation::Median)
            .info();
        let reply = run(trial("first_class", median, plan, file.path().to_path_buf()));
        let evaluation = reply.result.unwrap();
        assert_eq!(evaluation.score, 0.5);
        assert_eq!(evaluation.fold_scores.len(), 3);
    }

    #[test]
    fn setup_check_reports_unresolved_names() {
        assert_eq!(check("first_class", "accuracy").result, Ok(()));

        let reply = check("first_class", "custom_auc");
        assert_eq!(reply.result, Err("unknown metric custom_auc".to_string()));

        let reply = check("missing", "accuracy");
        assert_eq!(reply.result, Err("unknown pipeline missing".to_string()));
    }

    #[test]
    fn malformed_request_is_an_error() {
        let mut output = Vec::new();
        let result = serve(
            Cursor::new("not json\n"),
            &mut output,
            resolve_pipeline,
            MetricDefinition::builtin,
        );
        assert!(result.is_err());
        assert!(output.is_empty());
    }

    #[test]
    fn worker_command_marks_worker_env() {
        let command = WorkerCommand::new("/bin/true")
            .with_arg("--quiet")
            .with_env("RUST_LOG", "warn");
        let cmd = command.command();
        let envs: Vec<_> = cmd.get_envs().collect();
        assert!(envs
            .iter()
            .any(|(k, v)| *k == WORKER_ENV && v.map(|v| v == "1").unwrap_or(false)));
        assert_eq!(cmd.get_args().count(), 1);
    }
}
