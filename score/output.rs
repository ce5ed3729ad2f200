// ========================================================================================
//
//                              Score artifact I/O
//
// ========================================================================================
//
// The score artifact is a small delimited table keyed by (FID, IID):
//
//     FID IID PHENO CNT CNT2 SCORE
//
// CNT and CNT2 both carry the matched-variant count. The writer stages the table in
// a uniquely named sibling file and renames it into place, so a reader never sees a
// partially written artifact.

use crate::io::for_each_line;
use crate::types::SampleRecord;
use clap::ValueEnum;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SCORE_HEADER: [&str; 6] = ["FID", "IID", "PHENO", "CNT", "CNT2", "SCORE"];

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("I/O error for file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("delimited-text error in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("malformed row in {} at line {line}: {message}", path.display())]
    Format {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("{samples} sample records but {scores} scores")]
    LengthMismatch { samples: usize, scores: usize },
}

impl From<(PathBuf, io::Error)> for OutputError {
    fn from((path, source): (PathBuf, io::Error)) -> Self {
        OutputError::Io { path, source }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Delimiter {
    #[default]
    Space,
    Comma,
    Tab,
}

impl Delimiter {
    #[inline]
    pub fn as_byte(self) -> u8 {
        match self {
            Delimiter::Space => b' ',
            Delimiter::Comma => b',',
            Delimiter::Tab => b'\t',
        }
    }
}

/// How a score artifact is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFormat {
    pub delimiter: Delimiter,
    pub header: bool,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            delimiter: Delimiter::Space,
            header: true,
        }
    }
}

/// One row of a score artifact as read back for evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRow {
    pub family_id: String,
    pub individual_id: String,
    /// The raw outcome token carried through from the sample manifest.
    pub phenotype: String,
    pub variant_count: usize,
    pub score: f64,
}

/// Writes one row per sample. `samples` and `scores` must have the same length and order.
pub fn write_score_file(
    path: &Path,
    samples: &[SampleRecord],
    scores: &[f64],
    variant_count: usize,
    format: OutputFormat,
) -> Result<(), OutputError> {
    if samples.len() != scores.len() {
        return Err(OutputError::LengthMismatch {
            samples: samples.len(),
            scores: scores.len(),
        });
    }

    let (temp_path, temp_file) = create_staging_file(path)?;
    let csv_err = |source| OutputError::Csv {
        path: temp_path.clone(),
        source,
    };

    let write_result = (|| -> Result<(), OutputError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(format.delimiter.as_byte())
            .has_headers(false)
            .from_writer(BufWriter::new(temp_file));

        if format.header {
            writer.write_record(SCORE_HEADER).map_err(csv_err)?;
        }

        let count = variant_count.to_string();
        let mut ryu_buffer = ryu::Buffer::new();
        for (sample, &score) in samples.iter().zip(scores) {
            writer
                .write_record([
                    sample.family_id.as_str(),
                    sample.individual_id.as_str(),
                    sample.phenotype.as_str(),
                    count.as_str(),
                    count.as_str(),
                    ryu_buffer.format(score),
                ])
                .map_err(csv_err)?;
        }

        let buffered = writer.into_inner().map_err(|e| OutputError::Io {
            path: temp_path.clone(),
            source: e.into_error(),
        })?;
        let file = buffered.into_inner().map_err(|e| OutputError::Io {
            path: temp_path.clone(),
            source: e.into_error(),
        })?;
        file.sync_all().map_err(|e| OutputError::Io {
            path: temp_path.clone(),
            source: e,
        })
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    fs::rename(&temp_path, path).map_err(|source| {
        let _ = fs::remove_file(&temp_path);
        OutputError::Io {
            path: path.to_path_buf(),
            source,
        }
    })?;
    debug!("Wrote {} score rows to {}", samples.len(), path.display());
    Ok(())
}

/// Opens a fresh `.{name}.{pid}.{nanos}.tmp` file beside `path`.
fn create_staging_file(path: &Path) -> Result<(PathBuf, fs::File), OutputError> {
    let output_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let output_name = path.file_name().ok_or_else(|| OutputError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "output path has no file name"),
    })?;

    let pid = std::process::id();
    let ts_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    for attempt in 0..32u32 {
        let candidate = output_dir.join(format!(
            ".{}.{}.{}.tmp",
            output_name.to_string_lossy(),
            pid,
            ts_nanos + attempt as u128
        ));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(source) => {
                return Err(OutputError::Io {
                    path: candidate,
                    source,
                });
            }
        }
    }

    Err(OutputError::Io {
        path: output_dir.to_path_buf(),
        source: io::Error::new(
            io::ErrorKind::AlreadyExists,
            "failed to allocate a unique temporary output file",
        ),
    })
}

/// Reads a score artifact written by [`write_score_file`] with the same format.
///
/// With a header, columns are located by name so reordered tables still load.
/// Without one, the fixed `FID IID PHENO CNT CNT2 SCORE` positions are assumed.
pub fn read_score_file(path: &Path, format: OutputFormat) -> Result<Vec<ScoreRow>, OutputError> {
    let csv_err = |source| OutputError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let file = fs::File::open(path).map_err(|e| OutputError::from((path.to_path_buf(), e)))?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(format.delimiter.as_byte())
        .has_headers(format.header)
        .trim(csv::Trim::All)
        .from_reader(io::BufReader::new(file));

    let columns = if format.header {
        let headers = reader.headers().map_err(csv_err)?.clone();
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| OutputError::Format {
                    path: path.to_path_buf(),
                    line: 1,
                    message: format!("header lacks the '{name}' column"),
                })
        };
        [find("FID")?, find("IID")?, find("PHENO")?, find("CNT")?, find("SCORE")?]
    } else {
        [0, 1, 2, 3, 5]
    };

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(csv_err)?;
        let line = record.position().map_or(0, |p| p.line() as usize);
        let format_err = |message: String| OutputError::Format {
            path: path.to_path_buf(),
            line,
            message,
        };
        let field = |i: usize| {
            record
                .get(i)
                .ok_or_else(|| format_err(format!("missing column {}", i + 1)))
        };

        let [fid, iid, pheno, cnt, score] = columns;
        let cnt_text = field(cnt)?;
        let score_text = field(score)?;
        rows.push(ScoreRow {
            family_id: field(fid)?.to_string(),
            individual_id: field(iid)?.to_string(),
            phenotype: field(pheno)?.to_string(),
            variant_count: cnt_text
                .parse()
                .map_err(|_| format_err(format!("variant count '{cnt_text}' is not an integer")))?,
            score: score_text
                .parse()
                .map_err(|_| format_err(format!("score '{score_text}' is not a number")))?,
        });
    }
    Ok(rows)
}

/// One row of an external phenotype table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhenotypeRecord {
    pub family_id: String,
    pub individual_id: String,
    pub value: String,
}

/// Reads a whitespace-delimited `FID IID VALUE` table. A leading `FID IID ...`
/// header line is skipped.
pub fn read_phenotype_file(path: &Path) -> Result<Vec<PhenotypeRecord>, OutputError> {
    let mut records = Vec::new();
    for_each_line(path, |line_no, text| {
        let fields: Vec<&str> = text.split_whitespace().collect();
        let [fid, iid, value, ..] = fields[..] else {
            return Err(OutputError::Format {
                path: path.to_path_buf(),
                line: line_no,
                message: format!(
                    "expected at least 3 fields (FID IID VALUE), found {}",
                    fields.len()
                ),
            });
        };
        if records.is_empty() && fid.eq_ignore_ascii_case("FID") && iid.eq_ignore_ascii_case("IID") {
            return Ok(());
        }
        records.push(PhenotypeRecord {
            family_id: fid.to_string(),
            individual_id: iid.to_string(),
            value: value.to_string(),
        });
        Ok(())
    })?;
    Ok(records)
}
