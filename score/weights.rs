// ========================================================================================
//
//                              Effect-weight table parsing
//
// ========================================================================================
//
// Weight tables come from an external posterior-effect estimator and are treated as
// untrusted input: six tab-delimited columns, no header, every numeric field checked
// on entry. A malformed row aborts the whole file rather than being skipped.

use crate::io::for_each_line;
use crate::types::WeightRecord;
use log::debug;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const WEIGHT_COLUMNS: usize = 6;

#[derive(Debug, Error)]
pub enum WeightTableError {
    #[error("I/O error for file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed weight row in {} at line {line}: {message}", path.display())]
    Format {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

impl From<(PathBuf, io::Error)> for WeightTableError {
    fn from((path, source): (PathBuf, io::Error)) -> Self {
        WeightTableError::Io { path, source }
    }
}

/// Reads a weight table: `CHR SNP POS A1 A2 BETA`, tab-delimited, no header.
pub fn read_weight_table(path: &Path) -> Result<Vec<WeightRecord>, WeightTableError> {
    let mut records = Vec::new();

    for_each_line(path, |line_no, text| {
        let record = parse_weight_line(text).map_err(|message| WeightTableError::Format {
            path: path.to_path_buf(),
            line: line_no,
            message,
        })?;
        records.push(record);
        Ok::<(), WeightTableError>(())
    })?;

    debug!("Read {} weight records from {}", records.len(), path.display());
    Ok(records)
}

fn parse_weight_line(text: &str) -> Result<WeightRecord, String> {
    let fields: Vec<&str> = text.split('\t').map(str::trim).collect();
    let [chromosome, variant_id, position, allele1, allele2, weight] = fields[..] else {
        return Err(format!(
            "expected {WEIGHT_COLUMNS} tab-delimited fields (CHR SNP POS A1 A2 BETA), found {}",
            fields.len()
        ));
    };

    if variant_id.is_empty() {
        return Err("variant identifier is empty".to_string());
    }

    let position = position
        .parse::<u64>()
        .map_err(|_| format!("position '{position}' is not a non-negative integer"))?;

    let weight = weight
        .parse::<f64>()
        .map_err(|e| format!("effect weight '{weight}' could not be parsed: {e}"))?;
    if !weight.is_finite() {
        return Err(format!("effect weight '{weight}' is not finite"));
    }

    Ok(WeightRecord {
        chromosome: chromosome.to_string(),
        variant_id: variant_id.to_string(),
        position,
        allele1: allele1.to_string(),
        allele2: allele2.to_string(),
        weight,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_posterior_effect_rows_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pst_eff_chr1.txt");
        fs::write(
            &path,
            "1\trs3131972\t752721\tA\tG\t-1.334e-04\n1\trs3131969\t754182\tA\tG\t2.5e-05\n",
        )
        .unwrap();

        let records = read_weight_table(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].variant_id, "rs3131972");
        assert_eq!(records[0].position, 752721);
        assert!((records[0].weight + 1.334e-4).abs() < 1e-12);
        assert_eq!(records[1].allele1, "A");
    }

    #[test]
    fn malformed_numeric_fields_report_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        fs::write(&path, "1\trs1\t100\tA\tG\t0.1\n1\trs2\t200\tA\tG\tbeta\n").unwrap();

        match read_weight_table(&path).unwrap_err() {
            WeightTableError::Format { line, path: p, .. } => {
                assert_eq!(line, 2);
                assert_eq!(p, path);
            }
            other => panic!("expected Format, got {other:?}"),
        }
    }

    #[test]
    fn wrong_column_count_is_rejected() {
        assert!(parse_weight_line("1\trs1\t100\tA\tG").is_err());
        assert!(parse_weight_line("1\trs1\t100\tA\tG\t0.1\textra").is_err());
        // Space-delimited rows are not tab-delimited rows.
        assert!(parse_weight_line("1 rs1 100 A G 0.1").is_err());
    }

    #[test]
    fn negative_position_and_nan_weight_are_rejected() {
        assert!(parse_weight_line("1\trs1\t-5\tA\tG\t0.1").is_err());
        assert!(parse_weight_line("1\trs1\t5\tA\tG\tNaN").is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = read_weight_table(Path::new("/nonexistent/weights.txt")).unwrap_err();
        assert!(matches!(err, WeightTableError::Io { .. }));
    }
}
