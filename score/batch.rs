// ========================================================================================
//
//                               Multi-job batch runs
//
// ========================================================================================
//
// A batch manifest names several weight tables to score against one or more genotype
// filesets, optionally followed by an evaluation stage and pairwise R² comparisons.
//
// Each distinct genotype prefix is decoded once and shared read-only between the jobs
// that use it. Jobs run in parallel and fail independently: a corrupt fileset or a
// malformed weight table fails only the jobs that touch it, and the summary lists
// every failure with its reason.

use crate::evaluate::{EvaluationConfig, EvaluationResult, R2Comparison, compare_r2};
use crate::io::GenotypeStore;
use crate::output::OutputFormat;
use crate::pipeline::{
    EvaluationInputs, PipelineError, ScoringJob, ScoringReport, run_evaluation, run_scoring_job,
};
use ahash::{AHashMap, AHashSet};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const SUMMARY_FILE_NAME: &str = "batch_summary.json";
const SCORE_FILE_EXTENSION: &str = "profile";

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("I/O error for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not parse batch manifest {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid batch manifest {}: {message}", path.display())]
    Invalid { path: PathBuf, message: String },
    #[error("could not serialise batch summary to {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ========================================================================================
//                                    The manifest
// ========================================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchManifest {
    /// Default genotype prefix for jobs that do not name their own.
    #[serde(default)]
    pub genotypes: Option<PathBuf>,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub output: OutputFormat,
    /// Present only when the evaluation stage should run.
    #[serde(default)]
    pub evaluation: Option<EvaluationStage>,
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub comparisons: Vec<ComparisonSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub name: String,
    pub weights: PathBuf,
    #[serde(default)]
    pub genotypes: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluationStage {
    #[serde(default = "default_resamples")]
    pub resamples: usize,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub phenotype: Option<PathBuf>,
    #[serde(default = "default_missing_code")]
    pub missing_code: String,
}

fn default_resamples() -> usize {
    EvaluationConfig::default().resamples
}
fn default_confidence() -> f64 {
    EvaluationConfig::default().confidence
}
fn default_seed() -> u64 {
    EvaluationConfig::default().seed
}
fn default_missing_code() -> String {
    "-9".to_string()
}

impl EvaluationStage {
    pub fn config(&self) -> EvaluationConfig {
        EvaluationConfig {
            resamples: self.resamples,
            confidence: self.confidence,
            seed: self.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComparisonSpec {
    pub candidate: String,
    pub baseline: String,
}

impl BatchManifest {
    /// Loads a manifest and resolves its relative paths against the manifest's directory.
    pub fn load(path: &Path) -> Result<Self, BatchError> {
        let text = fs::read_to_string(path).map_err(|source| BatchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest: BatchManifest =
            toml::from_str(&text).map_err(|source| BatchError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        manifest.resolve_paths(base);
        manifest.validate().map_err(|message| BatchError::Invalid {
            path: path.to_path_buf(),
            message,
        })?;
        Ok(manifest)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(g) = self.genotypes.as_mut() {
            resolve(g);
        }
        resolve(&mut self.output_dir);
        if let Some(stage) = self.evaluation.as_mut() {
            if let Some(p) = stage.phenotype.as_mut() {
                resolve(p);
            }
        }
        for job in &mut self.jobs {
            resolve(&mut job.weights);
            if let Some(g) = job.genotypes.as_mut() {
                resolve(g);
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.jobs.is_empty() {
            return Err("no [[jobs]] entries".to_string());
        }
        let mut names = AHashSet::with_capacity(self.jobs.len());
        for job in &self.jobs {
            if job.name.is_empty() || job.name.contains(['/', '\\']) {
                return Err(format!(
                    "job name '{}' must be non-empty and contain no path separators",
                    job.name
                ));
            }
            if !names.insert(job.name.as_str()) {
                return Err(format!("job name '{}' is used more than once", job.name));
            }
            if job.genotypes.is_none() && self.genotypes.is_none() {
                return Err(format!(
                    "job '{}' names no genotypes and there is no default",
                    job.name
                ));
            }
        }
        if let Some(stage) = &self.evaluation {
            stage.config().validate().map_err(|e| e.to_string())?;
        }
        for cmp in &self.comparisons {
            for name in [&cmp.candidate, &cmp.baseline] {
                if !names.contains(name.as_str()) {
                    return Err(format!("comparison refers to unknown job '{name}'"));
                }
            }
            if self.evaluation.is_none() {
                return Err("[[comparisons]] require an [evaluation] section".to_string());
            }
        }
        Ok(())
    }

    /// The genotype prefix a job reads.
    pub fn genotypes_for<'a>(&'a self, job: &'a JobSpec) -> Option<&'a Path> {
        job.genotypes.as_deref().or(self.genotypes.as_deref())
    }

    pub fn output_path(&self, job: &JobSpec) -> PathBuf {
        self.output_dir
            .join(format!("{}.{SCORE_FILE_EXTENSION}", job.name))
    }
}

// ========================================================================================
//                                    The summary
// ========================================================================================

#[derive(Debug, Clone, Serialize)]
pub struct CompletedJob {
    #[serde(flatten)]
    pub scoring: ScoringReport,
    pub evaluation: Option<EvaluationResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub name: String,
    pub stage: &'static str,
    pub kind: &'static str,
    pub reason: String,
}

impl JobFailure {
    fn new(name: &str, stage: &'static str, error: &PipelineError) -> Self {
        Self {
            name: name.to_string(),
            stage,
            kind: error.kind(),
            reason: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedComparison {
    pub candidate: String,
    pub baseline: String,
    #[serde(flatten)]
    pub result: R2Comparison,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub completed: Vec<CompletedJob>,
    pub failed: Vec<JobFailure>,
    pub comparisons: Vec<NamedComparison>,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn write_json(&self, path: &Path) -> Result<(), BatchError> {
        let text = serde_json::to_string_pretty(self).map_err(|source| BatchError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, text).map_err(|source| BatchError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Display for BatchSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Completed {} job(s), {} failed.",
            self.completed.len(),
            self.failed.len()
        )?;
        for job in &self.completed {
            write!(
                f,
                "  OK   {:<24} {} ({} samples, {} variants)",
                job.scoring.name,
                job.scoring.output.display(),
                job.scoring.n_samples,
                job.scoring.variant_count
            )?;
            if let Some(eval) = &job.evaluation {
                write!(
                    f,
                    " R2={:.4} [{:.4}, {:.4}] p={:.2e}",
                    eval.r2, eval.ci_lower, eval.ci_upper, eval.p_value
                )?;
            }
            writeln!(f)?;
        }
        for failure in &self.failed {
            writeln!(
                f,
                "  FAIL {:<24} {} during {}: {}",
                failure.name, failure.kind, failure.stage, failure.reason
            )?;
        }
        for cmp in &self.comparisons {
            writeln!(
                f,
                "  {} vs {}: dR2={:+.4} ({})",
                cmp.candidate,
                cmp.baseline,
                cmp.result.delta_r2,
                if cmp.result.candidate_better {
                    "candidate better"
                } else {
                    "candidate not better"
                }
            )?;
        }
        Ok(())
    }
}

// ========================================================================================
//                                     The runner
// ========================================================================================

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

type StoreCache = AHashMap<PathBuf, Result<Arc<GenotypeStore>, Arc<PipelineError>>>;

/// Decodes every distinct genotype prefix once, in parallel.
fn load_stores(manifest: &BatchManifest) -> StoreCache {
    let mut prefixes: Vec<&Path> = Vec::new();
    for job in &manifest.jobs {
        if let Some(prefix) = manifest.genotypes_for(job) {
            if !prefixes.contains(&prefix) {
                prefixes.push(prefix);
            }
        }
    }
    info!("Decoding {} genotype fileset(s)", prefixes.len());

    prefixes
        .par_iter()
        .map(|&prefix| {
            let store = GenotypeStore::open(prefix)
                .map(Arc::new)
                .map_err(|e| Arc::new(PipelineError::from(e)));
            (prefix.to_path_buf(), store)
        })
        .collect::<Vec<_>>()
        .into_iter()
        .collect()
}

/// Runs every job of the manifest, then the evaluation stage and comparisons, and
/// writes the summary as JSON into the output directory.
pub fn run_batch(manifest: &BatchManifest) -> Result<BatchSummary, BatchError> {
    fs::create_dir_all(&manifest.output_dir).map_err(|source| BatchError::Io {
        path: manifest.output_dir.clone(),
        source,
    })?;

    let stores = load_stores(manifest);
    let pb = create_progress_bar(manifest.jobs.len() as u64, "scoring jobs");

    let scored: Vec<Result<ScoringReport, JobFailure>> = manifest
        .jobs
        .par_iter()
        .map(|job| {
            let result = score_one(manifest, &stores, job);
            pb.inc(1);
            result
        })
        .collect();
    pb.finish_and_clear();

    let mut summary = BatchSummary::default();
    let mut reports = Vec::with_capacity(scored.len());
    for result in scored {
        match result {
            Ok(report) => reports.push(report),
            Err(failure) => {
                warn!("Job '{}' failed: {}", failure.name, failure.reason);
                summary.failed.push(failure);
            }
        }
    }
    // Genotype caches are no longer needed once every job has scored.
    drop(stores);

    match &manifest.evaluation {
        Some(stage) => {
            let evaluated: Vec<_> = reports
                .into_par_iter()
                .map(|report| {
                    let inputs = EvaluationInputs {
                        profile: report.output.clone(),
                        format: manifest.output,
                        phenotype: stage.phenotype.clone(),
                        missing_code: stage.missing_code.clone(),
                    };
                    let result = run_evaluation(&inputs, &stage.config());
                    (report, result)
                })
                .collect();
            for (report, result) in evaluated {
                match result {
                    Ok(evaluation) => summary.completed.push(CompletedJob {
                        scoring: report,
                        evaluation: Some(evaluation),
                    }),
                    Err(e) => {
                        warn!("Evaluation of '{}' failed: {e}", report.name);
                        summary
                            .failed
                            .push(JobFailure::new(&report.name, "evaluation", &e));
                    }
                }
            }
        }
        None => {
            summary.completed = reports
                .into_iter()
                .map(|scoring| CompletedJob {
                    scoring,
                    evaluation: None,
                })
                .collect();
        }
    }

    summary.comparisons = compare_jobs(manifest, &summary.completed);

    let summary_path = manifest.output_dir.join(SUMMARY_FILE_NAME);
    summary.write_json(&summary_path)?;
    info!(
        "Batch finished: {} completed, {} failed; summary at {}",
        summary.completed.len(),
        summary.failed.len(),
        summary_path.display()
    );
    Ok(summary)
}

fn score_one(
    manifest: &BatchManifest,
    stores: &StoreCache,
    job: &JobSpec,
) -> Result<ScoringReport, JobFailure> {
    let prefix = manifest.genotypes_for(job).ok_or_else(|| JobFailure {
        name: job.name.clone(),
        stage: "load",
        kind: "ConfigError",
        reason: "no genotype prefix".to_string(),
    })?;
    let store = match stores.get(prefix) {
        Some(Ok(store)) => Arc::clone(store),
        Some(Err(e)) => return Err(JobFailure::new(&job.name, "load", e)),
        None => {
            return Err(JobFailure {
                name: job.name.clone(),
                stage: "load",
                kind: "IoError",
                reason: format!("genotype fileset {} was not loaded", prefix.display()),
            });
        }
    };

    let scoring = ScoringJob {
        name: job.name.clone(),
        weights: job.weights.clone(),
        output: manifest.output_path(job),
        format: manifest.output,
    };
    run_scoring_job(&store, &scoring).map_err(|e| JobFailure::new(&job.name, "scoring", &e))
}

fn compare_jobs(manifest: &BatchManifest, completed: &[CompletedJob]) -> Vec<NamedComparison> {
    let evaluated: AHashMap<&str, &EvaluationResult> = completed
        .iter()
        .filter_map(|job| {
            job.evaluation
                .as_ref()
                .map(|e| (job.scoring.name.as_str(), e))
        })
        .collect();

    let mut out = Vec::with_capacity(manifest.comparisons.len());
    for cmp in &manifest.comparisons {
        match (
            evaluated.get(cmp.candidate.as_str()),
            evaluated.get(cmp.baseline.as_str()),
        ) {
            (Some(candidate), Some(baseline)) => {
                let result = compare_r2(candidate, baseline);
                info!(
                    "{} vs {}: R2 {:.4} vs {:.4}, dR2 = {:+.4}",
                    cmp.candidate,
                    cmp.baseline,
                    result.candidate_r2,
                    result.baseline_r2,
                    result.delta_r2
                );
                out.push(NamedComparison {
                    candidate: cmp.candidate.clone(),
                    baseline: cmp.baseline.clone(),
                    result,
                });
            }
            _ => warn!(
                "Skipping comparison {} vs {}: at least one job has no evaluation",
                cmp.candidate, cmp.baseline
            ),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_defaults_and_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.toml");
        fs::write(
            &path,
            r#"
genotypes = "geno/EAS"
output_dir = "out"

[[jobs]]
name = "model1"
weights = "w/model1.txt"

[[jobs]]
name = "model2"
weights = "/abs/model2.txt"
genotypes = "other/EUR"
"#,
        )
        .unwrap();

        let manifest = BatchManifest::load(&path).unwrap();
        assert_eq!(manifest.output, OutputFormat::default());
        assert!(manifest.evaluation.is_none());
        assert_eq!(manifest.output_dir, dir.path().join("out"));
        assert_eq!(manifest.jobs[0].weights, dir.path().join("w/model1.txt"));
        assert_eq!(manifest.jobs[1].weights, PathBuf::from("/abs/model2.txt"));
        assert_eq!(
            manifest.genotypes_for(&manifest.jobs[0]),
            Some(dir.path().join("geno/EAS").as_path())
        );
        assert_eq!(
            manifest.output_path(&manifest.jobs[1]),
            dir.path().join("out/model2.profile")
        );
    }

    #[test]
    fn evaluation_section_takes_defaults() {
        let manifest: BatchManifest = toml::from_str(
            r#"
output_dir = "out"
genotypes = "g"
[evaluation]
seed = 7
[[jobs]]
name = "a"
weights = "a.txt"
"#,
        )
        .unwrap();
        let stage = manifest.evaluation.unwrap();
        assert_eq!(stage.missing_code, "-9");
        assert_eq!(
            stage.config(),
            EvaluationConfig {
                seed: 7,
                ..EvaluationConfig::default()
            }
        );
    }

    #[test]
    fn invalid_manifests_are_rejected() {
        let parse = |text: &str| toml::from_str::<BatchManifest>(text).unwrap();

        let duplicate = parse(
            "output_dir='o'\ngenotypes='g'\n[[jobs]]\nname='a'\nweights='x'\n[[jobs]]\nname='a'\nweights='y'\n",
        );
        assert!(duplicate.validate().unwrap_err().contains("more than once"));

        let no_genotypes = parse("output_dir='o'\n[[jobs]]\nname='a'\nweights='x'\n");
        assert!(no_genotypes.validate().is_err());

        let unknown = parse(
            "output_dir='o'\ngenotypes='g'\n[evaluation]\n[[jobs]]\nname='a'\nweights='x'\n[[comparisons]]\ncandidate='a'\nbaseline='b'\n",
        );
        assert!(unknown.validate().unwrap_err().contains("unknown job 'b'"));

        let bad_confidence =
            parse("output_dir='o'\ngenotypes='g'\n[evaluation]\nconfidence=1.5\n[[jobs]]\nname='a'\nweights='x'\n");
        assert!(bad_confidence.validate().is_err());

        assert!(toml::from_str::<BatchManifest>("output_dir='o'\nbogus=1\njobs=[]\n").is_err());
    }

    #[test]
    fn summary_display_lists_failures() {
        let summary = BatchSummary {
            completed: Vec::new(),
            failed: vec![JobFailure {
                name: "model5".to_string(),
                stage: "scoring",
                kind: "FormatError",
                reason: "malformed weight row".to_string(),
            }],
            comparisons: Vec::new(),
        };
        let text = summary.to_string();
        assert!(text.contains("0 job(s), 1 failed"));
        assert!(text.contains("FAIL model5"));
        assert!(!summary.is_success());
    }
}
