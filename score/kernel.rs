// ========================================================================================
//
//                              THE SCORE KERNEL
//
// ========================================================================================
//
// ### Purpose ###
//
// This module computes one linear score per sample from the decoded genotype matrix
// and a matched alignment. Missing genotypes are replaced by the mean of the
// non-missing codes of the same variant before they enter the dot product.
//
// ### Determinism ###
//
// Column means are computed in parallel but collected in alignment order, and every
// sample accumulates its contributions strictly in alignment order. The output is
// therefore bit-for-bit identical across runs and thread counts.

use crate::io::GenotypeMatrix;
use crate::types::{BimRowIndex, MISSING_GENOTYPE, MatchedAlignment};
use ndarray::{Array1, ArrayView1, Zip};
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KernelError {
    #[error(
        "variant column {column} has no non-missing genotypes, so its imputation mean is undefined"
    )]
    DegenerateInput { column: usize },
    #[error("alignment references column {column} but the genotype matrix has {n_variants} variants")]
    ColumnOutOfRange { column: usize, n_variants: usize },
}

/// One score per sample, in sample-manifest order.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreVector {
    pub scores: Array1<f64>,
    /// Number of variants that contributed, i.e. the alignment length.
    pub variant_count: usize,
    /// Number of missing genotype codes replaced by a column mean.
    pub imputed_genotypes: usize,
}

impl ScoreVector {
    #[inline]
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn summary(&self) -> ScoreSummary {
        ScoreSummary::of(self.scores.view())
    }
}

/// Distribution of a score vector, reported after each scoring job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreSummary {
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl ScoreSummary {
    pub fn of(values: ArrayView1<f64>) -> Self {
        if values.is_empty() {
            return Self {
                mean: 0.0,
                std: 0.0,
                min: 0.0,
                max: 0.0,
            };
        }
        let mean = values.sum() / values.len() as f64;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        Self {
            mean,
            std: var.sqrt(),
            min,
            max,
        }
    }
}

/// Mean of the non-missing codes of one variant, or `None` if every code is missing.
#[inline]
pub fn column_mean(column: ArrayView1<u8>) -> Option<f64> {
    let (sum, count) = column
        .iter()
        .filter(|&&code| code != MISSING_GENOTYPE)
        .fold((0u64, 0u64), |(sum, count), &code| (sum + code as u64, count + 1));
    (count > 0).then(|| sum as f64 / count as f64)
}

/// Returns the dosages of one variant with every missing code replaced by the
/// variant's non-missing mean.
pub fn impute_column(
    matrix: &GenotypeMatrix,
    column: BimRowIndex,
) -> Result<Array1<f64>, KernelError> {
    let codes = checked_column(matrix, column)?;
    let mean = column_mean(codes).ok_or(KernelError::DegenerateInput { column: column.0 })?;
    Ok(codes.mapv(|code| dosage(code, mean)))
}

/// Computes `score[i] = Σ_j weight_j · imputed_dosage[i, column_j]` over the alignment.
///
/// An empty alignment is valid and yields a zero score for every sample.
pub fn compute_scores(
    matrix: &GenotypeMatrix,
    alignment: &MatchedAlignment,
) -> Result<ScoreVector, KernelError> {
    let means: Vec<f64> = alignment
        .entries()
        .par_iter()
        .map(|entry| {
            let codes = checked_column(matrix, entry.column)?;
            column_mean(codes).ok_or(KernelError::DegenerateInput {
                column: entry.column.0,
            })
        })
        .collect::<Result<_, _>>()?;

    let mut scores = Array1::<f64>::zeros(matrix.n_samples());
    let mut imputed_genotypes = 0usize;

    for (entry, &mean) in alignment.entries().iter().zip(&means) {
        let codes = matrix.column(entry.column);
        let weight = entry.weight;
        Zip::from(&mut scores).and(&codes).for_each(|score, &code| {
            *score += weight * dosage(code, mean);
        });
        imputed_genotypes += codes.iter().filter(|&&c| c == MISSING_GENOTYPE).count();
    }

    Ok(ScoreVector {
        scores,
        variant_count: alignment.len(),
        imputed_genotypes,
    })
}

#[inline(always)]
fn dosage(code: u8, mean: f64) -> f64 {
    if code == MISSING_GENOTYPE {
        mean
    } else {
        code as f64
    }
}

fn checked_column(
    matrix: &GenotypeMatrix,
    column: BimRowIndex,
) -> Result<ArrayView1<'_, u8>, KernelError> {
    if column.0 >= matrix.n_variants() {
        return Err(KernelError::ColumnOutOfRange {
            column: column.0,
            n_variants: matrix.n_variants(),
        });
    }
    Ok(matrix.column(column))
}
