// ========================================================================================
//
//                              The scoring pipeline
//
// ========================================================================================
//
// Wires the stages together for one job: read weights, match them against an
// already decoded genotype store, score, and persist. The evaluation stage runs
// later and only ever sees the persisted score artifact.

use crate::evaluate::{EvaluationConfig, EvaluationError, EvaluationResult, evaluate, parse_outcome};
use crate::io::{GenotypeIoError, GenotypeStore};
use crate::kernel::{KernelError, ScoreSummary, compute_scores};
use crate::output::{OutputError, OutputFormat, read_phenotype_file, read_score_file, write_score_file};
use crate::prepare::{MatchReport, match_weights_to_variants};
use crate::weights::{WeightTableError, read_weight_table};
use ahash::AHashMap;
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Genotype(#[from] GenotypeIoError),
    #[error(transparent)]
    Weights(#[from] WeightTableError),
    #[error("{source} (variant '{variant_id}')")]
    Kernel {
        variant_id: String,
        #[source]
        source: KernelError,
    },
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error("bad outcome for sample {sample} in {}: {message}", path.display())]
    Outcome {
        path: PathBuf,
        sample: String,
        message: String,
    },
}

impl PipelineError {
    /// The failure category reported in summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Genotype(GenotypeIoError::Io { .. })
            | PipelineError::Weights(WeightTableError::Io { .. })
            | PipelineError::Output(OutputError::Io { .. }) => "IoError",
            PipelineError::Genotype(GenotypeIoError::Format { .. })
            | PipelineError::Weights(WeightTableError::Format { .. })
            | PipelineError::Output(OutputError::Format { .. })
            | PipelineError::Evaluation(EvaluationError::NonFinite { .. })
            | PipelineError::Outcome { .. } => "FormatError",
            PipelineError::Output(OutputError::Csv { source, .. }) => {
                if source.is_io_error() {
                    "IoError"
                } else {
                    "FormatError"
                }
            }
            PipelineError::Genotype(
                GenotypeIoError::CorruptFormat { .. } | GenotypeIoError::InvalidCode { .. },
            ) => "CorruptFormatError",
            PipelineError::Kernel {
                source: KernelError::DegenerateInput { .. },
                ..
            } => "DegenerateInputError",
            PipelineError::Kernel {
                source: KernelError::ColumnOutOfRange { .. },
                ..
            }
            | PipelineError::Output(OutputError::LengthMismatch { .. })
            | PipelineError::Evaluation(EvaluationError::LengthMismatch { .. }) => {
                "ShapeMismatchError"
            }
            PipelineError::Evaluation(EvaluationError::InsufficientData { .. }) => {
                "InsufficientDataError"
            }
            PipelineError::Evaluation(EvaluationError::InvalidConfig(_)) => "ConfigError",
        }
    }
}

/// One weight table scored against one genotype store.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringJob {
    pub name: String,
    pub weights: PathBuf,
    pub output: PathBuf,
    pub format: OutputFormat,
}

/// What a finished scoring job produced.
#[derive(Debug, Clone, Serialize)]
pub struct ScoringReport {
    pub name: String,
    pub output: PathBuf,
    pub n_samples: usize,
    pub variant_count: usize,
    pub imputed_genotypes: usize,
    pub matching: MatchReport,
    pub scores: ScoreSummary,
}

/// Runs one job against a decoded store. The store is only read.
pub fn run_scoring_job(
    store: &GenotypeStore,
    job: &ScoringJob,
) -> Result<ScoringReport, PipelineError> {
    let start = Instant::now();
    let weights = read_weight_table(&job.weights)?;
    info!(
        "[{}] Loaded {} weight records from {}",
        job.name,
        weights.len(),
        job.weights.display()
    );

    let outcome = match_weights_to_variants(&store.variants, &weights);
    if outcome.report.unmatched > 0 {
        warn!(
            "[{}] {} of {} weight records did not match any variant",
            job.name, outcome.report.unmatched, outcome.report.total_weight_records
        );
    }

    let scores = compute_scores(&store.genotypes, &outcome.alignment).map_err(|source| {
        let column = match source {
            KernelError::DegenerateInput { column } => Some(column),
            KernelError::ColumnOutOfRange { .. } => None,
        };
        PipelineError::Kernel {
            variant_id: column
                .and_then(|c| store.variants.get(c))
                .map_or_else(|| "?".to_string(), |v| v.variant_id.clone()),
            source,
        }
    })?;

    write_score_file(
        &job.output,
        &store.samples,
        &scores.scores.to_vec(),
        scores.variant_count,
        job.format,
    )?;

    let summary = scores.summary();
    info!(
        "[{}] Scored {} samples over {} variants in {:.2?}: mean={:.4}, std={:.4}, range=[{:.4}, {:.4}]",
        job.name,
        scores.len(),
        scores.variant_count,
        start.elapsed(),
        summary.mean,
        summary.std,
        summary.min,
        summary.max
    );

    Ok(ScoringReport {
        name: job.name.clone(),
        output: job.output.clone(),
        n_samples: scores.len(),
        variant_count: scores.variant_count,
        imputed_genotypes: scores.imputed_genotypes,
        matching: outcome.report,
        scores: summary,
    })
}

/// Where the evaluation stage finds its scores and outcomes.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationInputs {
    pub profile: PathBuf,
    pub format: OutputFormat,
    /// An external `FID IID VALUE` table. Without one, the PHENO column of the
    /// score artifact is the outcome.
    pub phenotype: Option<PathBuf>,
    pub missing_code: String,
}

/// Scores and outcomes paired by sample, with unusable samples removed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PairedOutcomes {
    pub scores: Vec<f64>,
    pub outcomes: Vec<f64>,
    /// Samples whose outcome was a missing placeholder.
    pub missing: usize,
    /// Samples absent from the external phenotype table.
    pub unjoined: usize,
}

/// Reads the score artifact and pairs every row with its outcome.
pub fn load_paired_outcomes(inputs: &EvaluationInputs) -> Result<PairedOutcomes, PipelineError> {
    let rows = read_score_file(&inputs.profile, inputs.format)?;

    let external = match &inputs.phenotype {
        Some(path) => {
            let records = read_phenotype_file(path)?;
            let mut by_key: AHashMap<(String, String), String> =
                AHashMap::with_capacity(records.len());
            let mut duplicates = 0usize;
            for record in records {
                if by_key
                    .insert((record.family_id, record.individual_id), record.value)
                    .is_some()
                {
                    duplicates += 1;
                }
            }
            if duplicates > 0 {
                warn!(
                    "{} duplicated (FID, IID) keys in {}; the later row wins",
                    duplicates,
                    path.display()
                );
            }
            Some((path.as_path(), by_key))
        }
        None => None,
    };

    let mut paired = PairedOutcomes::default();
    for row in &rows {
        let (source, token): (&Path, &str) = match &external {
            Some((path, by_key)) => {
                match by_key.get(&(row.family_id.clone(), row.individual_id.clone())) {
                    Some(value) => (*path, value.as_str()),
                    None => {
                        paired.unjoined += 1;
                        continue;
                    }
                }
            }
            None => (inputs.profile.as_path(), row.phenotype.as_str()),
        };

        match parse_outcome(token, &inputs.missing_code) {
            Ok(Some(value)) => {
                paired.scores.push(row.score);
                paired.outcomes.push(value);
            }
            Ok(None) => paired.missing += 1,
            Err(message) => {
                return Err(PipelineError::Outcome {
                    path: source.to_path_buf(),
                    sample: format!("{} {}", row.family_id, row.individual_id),
                    message,
                });
            }
        }
    }

    if paired.missing > 0 {
        warn!(
            "Excluded {} samples with a missing outcome from {}",
            paired.missing,
            inputs.profile.display()
        );
    }
    if paired.unjoined > 0 {
        warn!(
            "Excluded {} samples of {} absent from the phenotype table",
            paired.unjoined,
            inputs.profile.display()
        );
    }
    Ok(paired)
}

/// The evaluation stage for one persisted score artifact.
pub fn run_evaluation(
    inputs: &EvaluationInputs,
    config: &EvaluationConfig,
) -> Result<EvaluationResult, PipelineError> {
    let paired = load_paired_outcomes(inputs)?;
    let result = evaluate(&paired.scores, &paired.outcomes, config)?;
    info!(
        "Evaluated {}: n={}, R2={:.4} (CI {:.4}-{:.4}), r={:.4}, p={:.2e}",
        inputs.profile.display(),
        result.n_samples,
        result.r2,
        result.ci_lower,
        result.ci_upper,
        result.correlation,
        result.p_value
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FilesetPaths, GenotypeMatrix, write_bed_file, write_manifests};
    use crate::types::{SampleRecord, VariantRecord};
    use ndarray::array;
    use std::fs;

    fn fixture_store(dir: &Path, codes: ndarray::Array2<u8>) -> GenotypeStore {
        let prefix = dir.join("cohort");
        let paths = FilesetPaths::from_prefix(&prefix);
        let variants: Vec<_> = (0..codes.ncols())
            .map(|j| VariantRecord {
                chromosome: "1".to_string(),
                variant_id: format!("rs{}", j + 1),
                position: 100 * (j as u64 + 1),
                allele1: "A".to_string(),
                allele2: "G".to_string(),
            })
            .collect();
        let samples: Vec<_> = (0..codes.nrows())
            .map(|i| SampleRecord {
                family_id: format!("F{i}"),
                individual_id: format!("I{i}"),
                paternal_id: "0".to_string(),
                maternal_id: "0".to_string(),
                sex: "1".to_string(),
                phenotype: format!("{}", i as f64 * 0.5),
            })
            .collect();
        write_manifests(&paths, &variants, &samples).unwrap();
        write_bed_file(&paths.bed, &GenotypeMatrix::from_codes(codes).unwrap()).unwrap();
        GenotypeStore::open(&prefix).unwrap()
    }

    fn job(dir: &Path, weights: &str) -> ScoringJob {
        let path = dir.join("weights.txt");
        fs::write(&path, weights).unwrap();
        ScoringJob {
            name: "model".to_string(),
            weights: path,
            output: dir.join("model.profile"),
            format: OutputFormat::default(),
        }
    }

    #[test]
    fn scoring_job_writes_artifact_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let store = fixture_store(dir.path(), array![[0u8, 1], [2, 3], [1, 1], [0, 2]]);
        let job = job(
            dir.path(),
            "1\trs1\t100\tA\tG\t0.5\n1\tother\t200\tA\tG\t-0.3\n1\trs9\t900\tA\tG\t1.0\n",
        );

        let report = run_scoring_job(&store, &job).unwrap();
        assert_eq!(report.variant_count, 2);
        assert_eq!(report.matching.matched_by_position, 1);
        assert_eq!(report.matching.unmatched, 1);
        assert_eq!(report.imputed_genotypes, 1);

        let rows = read_score_file(&job.output, job.format).unwrap();
        let scores: Vec<f64> = rows.iter().map(|r| r.score).collect();
        for (got, want) in scores.iter().zip([-0.3, 0.6, 0.2, -0.6]) {
            assert!((got - want).abs() < 1e-6);
        }
        assert!(rows.iter().all(|r| r.variant_count == 2));
    }

    #[test]
    fn degenerate_column_names_the_variant() {
        let dir = tempfile::tempdir().unwrap();
        let store = fixture_store(dir.path(), array![[0u8, 3], [1, 3], [2, 3]]);
        let job = job(dir.path(), "1\trs2\t200\tA\tG\t1.0\n");

        let err = run_scoring_job(&store, &job).unwrap_err();
        assert_eq!(err.kind(), "DegenerateInputError");
        assert!(err.to_string().contains("rs2"));
        assert!(!job.output.exists());
    }

    #[test]
    fn malformed_weights_are_format_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = fixture_store(dir.path(), array![[0u8], [1], [2]]);
        let job = job(dir.path(), "1\trs1\t100\tA\tG\n");
        assert_eq!(run_scoring_job(&store, &job).unwrap_err().kind(), "FormatError");
    }

    #[test]
    fn evaluation_joins_external_phenotypes_and_drops_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join("p.profile");
        fs::write(
            &profile,
            "FID IID PHENO CNT CNT2 SCORE\n\
             F0 I0 -9 1 1 0.1\nF1 I1 -9 1 1 0.2\nF2 I2 -9 1 1 0.3\n\
             F3 I3 -9 1 1 0.4\nF4 I4 -9 1 1 0.5\n",
        )
        .unwrap();
        let pheno = dir.path().join("pheno.txt");
        fs::write(&pheno, "F0 I0 1.0\nF1 I1 NA\nF2 I2 2.9\nF4 I4 5.2\n").unwrap();

        let inputs = EvaluationInputs {
            profile,
            format: OutputFormat::default(),
            phenotype: Some(pheno),
            missing_code: "-9".to_string(),
        };
        let paired = load_paired_outcomes(&inputs).unwrap();
        assert_eq!(paired.scores, vec![0.1, 0.3, 0.5]);
        assert_eq!(paired.outcomes, vec![1.0, 2.9, 5.2]);
        assert_eq!(paired.missing, 1);
        assert_eq!(paired.unjoined, 1);

        let result = run_evaluation(&inputs, &EvaluationConfig::default()).unwrap();
        assert_eq!(result.n_samples, 3);
    }

    #[test]
    fn evaluation_on_manifest_placeholders_is_insufficient() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join("p.profile");
        fs::write(
            &profile,
            "FID IID PHENO CNT CNT2 SCORE\nF0 I0 -9 1 1 0.1\nF1 I1 2 1 1 0.2\nF2 I2 -9 1 1 0.3\n",
        )
        .unwrap();
        let inputs = EvaluationInputs {
            profile,
            format: OutputFormat::default(),
            phenotype: None,
            missing_code: "-9".to_string(),
        };
        let err = run_evaluation(&inputs, &EvaluationConfig::default()).unwrap_err();
        assert_eq!(err.kind(), "InsufficientDataError");
    }

    #[test]
    fn non_numeric_outcome_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join("p.profile");
        fs::write(
            &profile,
            "FID IID PHENO CNT CNT2 SCORE\nF0 I0 case 1 1 0.1\n",
        )
        .unwrap();
        let inputs = EvaluationInputs {
            profile,
            format: OutputFormat::default(),
            phenotype: None,
            missing_code: "-9".to_string(),
        };
        let err = load_paired_outcomes(&inputs).unwrap_err();
        assert_eq!(err.kind(), "FormatError");
        assert!(err.to_string().contains("F0 I0"));
    }
}
