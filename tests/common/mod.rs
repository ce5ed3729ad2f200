#![allow(dead_code)]

use ndarray::Array2;
use prscore::io::{FilesetPaths, GenotypeMatrix, write_bed_file, write_manifests};
use prscore::types::{SampleRecord, VariantRecord};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

pub struct Fileset {
    pub prefix: PathBuf,
    pub variants: Vec<VariantRecord>,
    pub samples: Vec<SampleRecord>,
    pub codes: Array2<u8>,
}

/// Writes a random fileset with roughly `missing_rate` missing calls.
pub fn write_random_fileset(
    dir: &Path,
    name: &str,
    n_samples: usize,
    n_variants: usize,
    missing_rate: f64,
    seed: u64,
) -> Fileset {
    let mut rng = StdRng::seed_from_u64(seed);
    let codes = Array2::from_shape_fn((n_samples, n_variants), |_| {
        if rng.r#gen::<f64>() < missing_rate {
            3u8
        } else {
            rng.gen_range(0..3u8)
        }
    });

    let variants: Vec<_> = (0..n_variants)
        .map(|j| VariantRecord {
            chromosome: (1 + j % 22).to_string(),
            variant_id: format!("rs{}", 10_000 + j),
            position: 1_000 + 37 * j as u64,
            allele1: "A".to_string(),
            allele2: "G".to_string(),
        })
        .collect();
    let samples: Vec<_> = (0..n_samples)
        .map(|i| SampleRecord {
            family_id: format!("FAM{i}"),
            individual_id: format!("IND{i}"),
            paternal_id: "0".to_string(),
            maternal_id: "0".to_string(),
            sex: (1 + i % 2).to_string(),
            phenotype: "-9".to_string(),
        })
        .collect();

    let prefix = dir.join(name);
    let paths = FilesetPaths::from_prefix(&prefix);
    write_manifests(&paths, &variants, &samples).unwrap();
    write_bed_file(&paths.bed, &GenotypeMatrix::from_codes(codes.clone()).unwrap()).unwrap();

    Fileset {
        prefix,
        variants,
        samples,
        codes,
    }
}

/// A weight row as written to disk.
pub struct WeightLine {
    pub chromosome: String,
    pub variant_id: String,
    pub position: u64,
    pub weight: f64,
}

pub fn write_weights(path: &Path, lines: &[WeightLine]) {
    let mut text = String::new();
    for l in lines {
        writeln!(
            text,
            "{}\t{}\t{}\tA\tG\t{}",
            l.chromosome, l.variant_id, l.position, l.weight
        )
        .unwrap();
    }
    fs::write(path, text).unwrap();
}

/// Weights for every `stride`-th variant, matched by id.
pub fn weights_by_id(fileset: &Fileset, stride: usize, seed: u64) -> Vec<WeightLine> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 0.05).unwrap();
    fileset
        .variants
        .iter()
        .step_by(stride)
        .map(|v| WeightLine {
            chromosome: v.chromosome.clone(),
            variant_id: v.variant_id.clone(),
            position: v.position,
            weight: normal.sample(&mut rng),
        })
        .collect()
}

/// The straightforward per-sample definition of a mean-imputed linear score.
pub fn reference_scores(codes: &Array2<u8>, columns: &[(usize, f64)]) -> Vec<f64> {
    let mut scores = vec![0.0; codes.nrows()];
    for &(j, w) in columns {
        let col = codes.column(j);
        let present: Vec<f64> = col.iter().filter(|&&c| c != 3).map(|&c| c as f64).collect();
        let mean = present.iter().sum::<f64>() / present.len() as f64;
        for (i, &c) in col.iter().enumerate() {
            scores[i] += w * if c == 3 { mean } else { c as f64 };
        }
    }
    scores
}

/// Ground-truth outcome `y = effect · z(score) + N(0, 0.6)`.
pub fn simulate_outcome(scores: &[f64], effect: f64, seed: u64) -> Vec<f64> {
    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let sd = (scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n).sqrt();
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.6).unwrap();
    scores
        .iter()
        .map(|s| effect * (s - mean) / sd + noise.sample(&mut rng))
        .collect()
}

pub fn write_phenotypes(path: &Path, samples: &[SampleRecord], values: &[f64]) {
    let mut text = String::from("FID IID PHENO\n");
    for (s, v) in samples.iter().zip(values) {
        writeln!(text, "{} {} {v}", s.family_id, s.individual_id).unwrap();
    }
    fs::write(path, text).unwrap();
}
