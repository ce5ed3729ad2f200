// ========================================================================================
//
//                            THE GENOTYPE STORE READER
//
// ========================================================================================
//
// ### Purpose ###
//
// This module turns a PLINK-style fileset (.bim variant manifest, .fam sample
// manifest, packed .bed genotype matrix) into owned, validated, in-memory records.
// The .bed decode is the hot path of the whole engine: the file is memory-mapped
// once, every variant's byte run is decoded straight into its final column of a
// pre-allocated column-major buffer, and variant runs are spread across the rayon
// pool. No per-variant allocation happens anywhere in the loop.

use crate::types::{BimRowIndex, MISSING_GENOTYPE, SampleRecord, VariantRecord};
use log::{debug, info, warn};
use memmap2::Mmap;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis, ShapeBuilder};
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;
use thiserror::Error;

/// Magic bytes of a variant-major packed genotype matrix.
pub const PLINK_MAGIC_HEADER: [u8; 3] = [0x6c, 0x1b, 0x01];

const PLINK_HEADER_LEN: usize = PLINK_MAGIC_HEADER.len();

#[derive(Debug, Error)]
pub enum GenotypeIoError {
    #[error("I/O error for file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed record in {} at line {line}: {message}", path.display())]
    Format {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("corrupt genotype matrix {}: {message}", path.display())]
    CorruptFormat { path: PathBuf, message: String },
    #[error("genotype code {code} at sample {sample}, variant {variant} is outside 0..=3")]
    InvalidCode {
        sample: usize,
        variant: usize,
        code: u8,
    },
}

impl GenotypeIoError {
    fn io(path: &Path, source: io::Error) -> Self {
        GenotypeIoError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ========================================================================================
//                                 In-memory genotype data
// ========================================================================================

/// A dense (samples × variants) matrix of raw genotype codes in {0, 1, 2, 3}.
///
/// Storage is column-major so that each variant's codes are contiguous, which is
/// the layout the decoder writes and the layout the score kernel reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenotypeMatrix {
    codes: Array2<u8>,
}

impl GenotypeMatrix {
    /// Wraps an existing code matrix after checking every code is a valid 2-bit value.
    pub fn from_codes(codes: Array2<u8>) -> Result<Self, GenotypeIoError> {
        for ((sample, variant), &code) in codes.indexed_iter() {
            if code > MISSING_GENOTYPE {
                return Err(GenotypeIoError::InvalidCode {
                    sample,
                    variant,
                    code,
                });
            }
        }
        Ok(Self { codes })
    }

    #[inline]
    pub fn n_samples(&self) -> usize {
        self.codes.nrows()
    }

    #[inline]
    pub fn n_variants(&self) -> usize {
        self.codes.ncols()
    }

    #[inline]
    pub fn codes(&self) -> ArrayView2<'_, u8> {
        self.codes.view()
    }

    /// The codes of one variant across all samples, in sample-manifest order.
    #[inline]
    pub fn column(&self, column: BimRowIndex) -> ArrayView1<'_, u8> {
        self.codes.column(column.0)
    }

    #[inline]
    pub fn get(&self, sample: usize, column: BimRowIndex) -> Option<u8> {
        self.codes.get((sample, column.0)).copied()
    }
}

/// The three paths of one genotype fileset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesetPaths {
    pub bed: PathBuf,
    pub bim: PathBuf,
    pub fam: PathBuf,
}

impl FilesetPaths {
    /// Resolves `prefix.{bed,bim,fam}`. A prefix that already carries one of the
    /// three extensions is accepted too.
    pub fn from_prefix(prefix: &Path) -> Self {
        let base = match prefix.extension().and_then(|e| e.to_str()) {
            Some("bed" | "bim" | "fam") => prefix.with_extension(""),
            _ => prefix.to_path_buf(),
        };
        Self {
            bed: apply_extension(&base, "bed"),
            bim: apply_extension(&base, "bim"),
            fam: apply_extension(&base, "fam"),
        }
    }
}

/// Appends an extension without clobbering dots that are part of the file stem
/// (e.g. `EAS_plink_5k.chr1`).
fn apply_extension(base: &Path, extension: &str) -> PathBuf {
    let mut os = base.as_os_str().to_os_string();
    os.push(".");
    os.push(extension);
    PathBuf::from(os)
}

/// A fully decoded genotype fileset. Immutable once produced.
#[derive(Debug, Clone)]
pub struct GenotypeStore {
    pub variants: Vec<VariantRecord>,
    pub samples: Vec<SampleRecord>,
    pub genotypes: GenotypeMatrix,
}

impl GenotypeStore {
    pub fn open(prefix: &Path) -> Result<Self, GenotypeIoError> {
        Self::open_paths(&FilesetPaths::from_prefix(prefix))
    }

    pub fn open_paths(paths: &FilesetPaths) -> Result<Self, GenotypeIoError> {
        let start = Instant::now();
        let variants = read_bim_records(&paths.bim)?;
        let samples = read_fam_records(&paths.fam)?;
        debug!(
            "Parsed manifests {} and {} in {:.2?}",
            paths.bim.display(),
            paths.fam.display(),
            start.elapsed()
        );

        let decode_start = Instant::now();
        let genotypes = decode_bed_file(&paths.bed, samples.len(), variants.len())?;
        info!(
            "Decoded {} samples x {} variants from {} in {:.2?}",
            samples.len(),
            variants.len(),
            paths.bed.display(),
            decode_start.elapsed()
        );

        Ok(Self {
            variants,
            samples,
            genotypes,
        })
    }
}

// ========================================================================================
//                                   Manifest parsing
// ========================================================================================

/// Calls `on_line` for every non-blank line of a text file with its 1-based line number.
/// A single line buffer is reused across the whole file.
pub(crate) fn for_each_line<F, E>(path: &Path, mut on_line: F) -> Result<(), E>
where
    F: FnMut(usize, &str) -> Result<(), E>,
    E: From<(PathBuf, io::Error)>,
{
    let file = File::open(path).map_err(|e| E::from((path.to_path_buf(), e)))?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut line_no = 0usize;

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| E::from((path.to_path_buf(), e)))?;
        if read == 0 {
            return Ok(());
        }
        line_no += 1;
        let content = line.trim_end_matches(['\n', '\r']);
        if content.trim().is_empty() {
            continue;
        }
        on_line(line_no, content)?;
    }
}

impl From<(PathBuf, io::Error)> for GenotypeIoError {
    fn from((path, source): (PathBuf, io::Error)) -> Self {
        GenotypeIoError::Io { path, source }
    }
}

/// Reads a variant manifest: `CHR SNP CM_POS BP_POS A1 A2`, whitespace-delimited, no header.
pub fn read_bim_records(path: &Path) -> Result<Vec<VariantRecord>, GenotypeIoError> {
    let mut records = Vec::new();

    for_each_line(path, |line_no, text| {
        let fields: Vec<&str> = text.split_whitespace().collect();
        let [chromosome, variant_id, _cm_position, bp_position, allele1, allele2] = fields[..]
        else {
            return Err(GenotypeIoError::Format {
                path: path.to_path_buf(),
                line: line_no,
                message: format!(
                    "expected 6 whitespace-delimited fields (CHR SNP CM BP A1 A2), found {}",
                    fields.len()
                ),
            });
        };

        let position = bp_position
            .parse::<u64>()
            .map_err(|_| GenotypeIoError::Format {
                path: path.to_path_buf(),
                line: line_no,
                message: format!("base-pair position '{bp_position}' is not a non-negative integer"),
            })?;

        records.push(VariantRecord {
            chromosome: chromosome.to_string(),
            variant_id: variant_id.to_string(),
            position,
            allele1: allele1.to_string(),
            allele2: allele2.to_string(),
        });
        Ok(())
    })?;

    Ok(records)
}

/// Reads a sample manifest: `FID IID PID MID SEX PHENO`, whitespace-delimited, no header.
pub fn read_fam_records(path: &Path) -> Result<Vec<SampleRecord>, GenotypeIoError> {
    let mut records = Vec::new();

    for_each_line(path, |line_no, text| {
        let fields: Vec<&str> = text.split_whitespace().collect();
        let [fid, iid, pid, mid, sex, phenotype] = fields[..] else {
            return Err(GenotypeIoError::Format {
                path: path.to_path_buf(),
                line: line_no,
                message: format!(
                    "expected 6 whitespace-delimited fields (FID IID PID MID SEX PHENO), found {}",
                    fields.len()
                ),
            });
        };

        records.push(SampleRecord {
            family_id: fid.to_string(),
            individual_id: iid.to_string(),
            paternal_id: pid.to_string(),
            maternal_id: mid.to_string(),
            sex: sex.to_string(),
            phenotype: phenotype.to_string(),
        });
        Ok(())
    })?;

    Ok(records)
}

// ========================================================================================
//                                Packed matrix decoding
// ========================================================================================

/// Memory-maps a packed genotype file and decodes it.
pub fn decode_bed_file(
    path: &Path,
    n_samples: usize,
    n_variants: usize,
) -> Result<GenotypeMatrix, GenotypeIoError> {
    let file = File::open(path).map_err(|e| GenotypeIoError::io(path, e))?;
    let file_len = file
        .metadata()
        .map_err(|e| GenotypeIoError::io(path, e))?
        .len();

    // Mapping a zero-length file is not portable; anything shorter than the
    // header is corrupt regardless.
    if file_len < PLINK_HEADER_LEN as u64 {
        return Err(GenotypeIoError::CorruptFormat {
            path: path.to_path_buf(),
            message: format!("file is {file_len} bytes, shorter than the 3-byte header"),
        });
    }

    // SAFETY: the mapping is read-only and dropped before this function returns;
    // the decoded matrix owns its own copy of the data.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| GenotypeIoError::io(path, e))?;
    decode_genotypes(&mmap, n_samples, n_variants, path)
}

/// Decodes a complete packed genotype buffer (header included).
///
/// `source` is only used to give errors a location.
pub fn decode_genotypes(
    bytes: &[u8],
    n_samples: usize,
    n_variants: usize,
    source: &Path,
) -> Result<GenotypeMatrix, GenotypeIoError> {
    validate_bed_header(bytes, source)?;

    let bytes_per_variant = n_samples.div_ceil(4);
    let required = bytes_per_variant
        .checked_mul(n_variants)
        .ok_or_else(|| GenotypeIoError::CorruptFormat {
            path: source.to_path_buf(),
            message: format!(
                "{n_samples} samples x {n_variants} variants overflows the addressable size"
            ),
        })?;
    let payload = &bytes[PLINK_HEADER_LEN..];

    if payload.len() < required {
        return Err(GenotypeIoError::CorruptFormat {
            path: source.to_path_buf(),
            message: format!(
                "truncated payload: expected {required} bytes ({bytes_per_variant} bytes x {n_variants} variants), found {}",
                payload.len()
            ),
        });
    }
    if payload.len() > required {
        warn!(
            "{} has {} trailing bytes after the last variant; ignoring them.",
            source.display(),
            payload.len() - required
        );
    }

    if n_samples == 0 || n_variants == 0 {
        return Ok(GenotypeMatrix {
            codes: Array2::zeros((n_samples, n_variants).f()),
        });
    }

    let table = decode_table();
    let mut data = vec![0u8; n_samples * n_variants];
    data.par_chunks_mut(n_samples)
        .zip(payload[..required].par_chunks(bytes_per_variant))
        .for_each(|(column, run)| decode_variant(run, column, table));

    let codes = Array2::from_shape_vec((n_samples, n_variants).f(), data).map_err(|e| {
        GenotypeIoError::CorruptFormat {
            path: source.to_path_buf(),
            message: format!("could not shape decoded buffer: {e}"),
        }
    })?;
    Ok(GenotypeMatrix { codes })
}

/// Expands one variant's byte run into `dest`, four samples per byte, low bits first.
#[inline]
fn decode_variant(run: &[u8], dest: &mut [u8], table: &[[u8; 4]; 256]) {
    let mut chunks = dest.chunks_mut(4);
    for (&byte, out) in run.iter().zip(&mut chunks) {
        let decoded = &table[byte as usize];
        out.copy_from_slice(&decoded[..out.len()]);
    }
}

fn decode_table() -> &'static [[u8; 4]; 256] {
    static TABLE: OnceLock<[[u8; 4]; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [[0u8; 4]; 256];
        for byte in 0u16..256 {
            for offset in 0..4 {
                table[byte as usize][offset] = ((byte >> (offset * 2)) & 0b11) as u8;
            }
        }
        table
    })
}

fn validate_bed_header(bytes: &[u8], source: &Path) -> Result<(), GenotypeIoError> {
    match bytes.get(..PLINK_HEADER_LEN) {
        Some(header) if header == PLINK_MAGIC_HEADER => Ok(()),
        Some([0x6c, 0x1b, mode]) => Err(GenotypeIoError::CorruptFormat {
            path: source.to_path_buf(),
            message: format!(
                "unsupported mode byte {mode:#04x} (only variant-major mode is supported)"
            ),
        }),
        Some(header) => Err(GenotypeIoError::CorruptFormat {
            path: source.to_path_buf(),
            message: format!(
                "bad magic bytes {:02x?}, expected {:02x?}",
                header, PLINK_MAGIC_HEADER
            ),
        }),
        None => Err(GenotypeIoError::CorruptFormat {
            path: source.to_path_buf(),
            message: format!(
                "file is {} bytes, shorter than the 3-byte header",
                bytes.len()
            ),
        }),
    }
}

// ========================================================================================
//                                Packed matrix encoding
// ========================================================================================

/// Packs a genotype matrix into the variant-major binary layout, header included.
pub fn encode_genotypes(matrix: &GenotypeMatrix) -> Vec<u8> {
    let bytes_per_variant = matrix.n_samples().div_ceil(4);
    let mut out = Vec::with_capacity(PLINK_HEADER_LEN + bytes_per_variant * matrix.n_variants());
    out.extend_from_slice(&PLINK_MAGIC_HEADER);

    for column in matrix.codes.axis_iter(Axis(1)) {
        let mut row = vec![0u8; bytes_per_variant];
        for (sample, &code) in column.iter().enumerate() {
            row[sample / 4] |= (code & 0b11) << ((sample % 4) * 2);
        }
        out.extend_from_slice(&row);
    }
    out
}

/// Writes a packed genotype file.
pub fn write_bed_file(path: &Path, matrix: &GenotypeMatrix) -> Result<(), GenotypeIoError> {
    let bytes = encode_genotypes(matrix);
    let mut file = File::create(path).map_err(|e| GenotypeIoError::io(path, e))?;
    file.write_all(&bytes)
        .and_then(|_| file.flush())
        .map_err(|e| GenotypeIoError::io(path, e))
}

/// Writes the variant and sample manifests that accompany a packed genotype file.
pub fn write_manifests(
    paths: &FilesetPaths,
    variants: &[VariantRecord],
    samples: &[SampleRecord],
) -> Result<(), GenotypeIoError> {
    let mut bim = String::new();
    for v in variants {
        bim.push_str(&format!(
            "{}\t{}\t0\t{}\t{}\t{}\n",
            v.chromosome, v.variant_id, v.position, v.allele1, v.allele2
        ));
    }
    fs::write(&paths.bim, bim).map_err(|e| GenotypeIoError::io(&paths.bim, e))?;

    let mut fam = String::new();
    for s in samples {
        fam.push_str(&format!(
            "{} {} {} {} {} {}\n",
            s.family_id, s.individual_id, s.paternal_id, s.maternal_id, s.sex, s.phenotype
        ));
    }
    fs::write(&paths.fam, fam).map_err(|e| GenotypeIoError::io(&paths.fam, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn matrix(codes: Array2<u8>) -> GenotypeMatrix {
        GenotypeMatrix::from_codes(codes).expect("valid codes")
    }

    #[test]
    fn decode_table_extracts_low_bits_first() {
        let table = decode_table();
        // 0b11_10_01_00 -> samples 0..4 hold 0, 1, 2, 3.
        assert_eq!(table[0b1110_0100], [0, 1, 2, 3]);
        assert_eq!(table[0xFF], [3, 3, 3, 3]);
    }

    #[test]
    fn round_trip_preserves_codes_including_missing() {
        let mut rng = StdRng::seed_from_u64(7);
        for &(n_samples, n_variants) in &[(1, 1), (4, 3), (5, 2), (13, 17), (64, 9)] {
            let codes =
                Array2::from_shape_fn((n_samples, n_variants), |_| rng.gen_range(0u8..=3));
            let original = matrix(codes);
            let bytes = encode_genotypes(&original);
            assert_eq!(bytes.len(), 3 + n_samples.div_ceil(4) * n_variants);

            let decoded =
                decode_genotypes(&bytes, n_samples, n_variants, Path::new("mem.bed")).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn known_layout_decodes_to_expected_matrix() {
        // Two variants, five samples: the second byte of each run holds one sample.
        let bytes = [0x6c, 0x1b, 0x01, 0b1110_0100, 0b0000_0001, 0b0000_0011, 0b0000_0010];
        let decoded = decode_genotypes(&bytes, 5, 2, Path::new("mem.bed")).unwrap();
        let expected = array![[0u8, 3], [1, 0], [2, 0], [3, 0], [1, 2]];
        assert_eq!(decoded.codes(), expected.view());
    }

    #[test]
    fn bad_magic_is_corrupt_format() {
        let bytes = [0x6c, 0x1b, 0x00, 0x00];
        let err = decode_genotypes(&bytes, 4, 1, Path::new("mem.bed")).unwrap_err();
        assert!(matches!(err, GenotypeIoError::CorruptFormat { .. }));

        let err = decode_genotypes(&[0x00, 0x01], 4, 1, Path::new("mem.bed")).unwrap_err();
        assert!(matches!(err, GenotypeIoError::CorruptFormat { .. }));
    }

    #[test]
    fn truncated_payload_is_corrupt_format() {
        // 6 samples need 2 bytes per variant; 3 variants need 6 bytes.
        let mut bytes = PLINK_MAGIC_HEADER.to_vec();
        bytes.extend_from_slice(&[0u8; 5]);
        let err = decode_genotypes(&bytes, 6, 3, Path::new("short.bed")).unwrap_err();
        match err {
            GenotypeIoError::CorruptFormat { path, message } => {
                assert_eq!(path, PathBuf::from("short.bed"));
                assert!(message.contains("truncated"), "{message}");
            }
            other => panic!("expected CorruptFormat, got {other:?}"),
        }
    }

    #[test]
    fn empty_dimensions_decode_to_empty_matrix() {
        let decoded = decode_genotypes(&PLINK_MAGIC_HEADER, 0, 0, Path::new("mem.bed")).unwrap();
        assert_eq!(decoded.n_samples(), 0);
        assert_eq!(decoded.n_variants(), 0);
    }

    #[test]
    fn from_codes_rejects_values_above_three() {
        let err = GenotypeMatrix::from_codes(array![[0u8, 4]]).unwrap_err();
        assert!(matches!(
            err,
            GenotypeIoError::InvalidCode {
                sample: 0,
                variant: 1,
                code: 4
            }
        ));
    }

    #[test]
    fn bim_rows_require_six_columns_and_numeric_position() {
        let dir = tempfile::tempdir().unwrap();
        let bim = dir.path().join("bad.bim");

        fs::write(&bim, "1\trs1\t0\t100\tA\tG\n1\trs2\t0\t200\tA\n").unwrap();
        match read_bim_records(&bim).unwrap_err() {
            GenotypeIoError::Format { line, .. } => assert_eq!(line, 2),
            other => panic!("expected Format, got {other:?}"),
        }

        fs::write(&bim, "1 rs1 0 1e5 A G\n").unwrap();
        assert!(matches!(
            read_bim_records(&bim).unwrap_err(),
            GenotypeIoError::Format { line: 1, .. }
        ));
    }

    #[test]
    fn bim_uses_base_pair_position_and_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let bim = dir.path().join("ok.bim");
        fs::write(&bim, "1 rs1 0.5 100 A G\n\n chr2\trs2\t0\t250\tC\tT \n").unwrap();

        let records = read_bim_records(&bim).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].position, 100);
        assert_eq!(records[1].chromosome, "chr2");
        assert_eq!(records[1].allele2, "T");
    }

    #[test]
    fn fam_rows_require_six_columns() {
        let dir = tempfile::tempdir().unwrap();
        let fam = dir.path().join("bad.fam");
        fs::write(&fam, "F1 I1 0 0 1 -9\nF2 I2 0 0 1\n").unwrap();
        assert!(matches!(
            read_fam_records(&fam).unwrap_err(),
            GenotypeIoError::Format { line: 2, .. }
        ));
    }

    #[test]
    fn store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("cohort.chr1");
        let paths = FilesetPaths::from_prefix(&prefix);
        assert_eq!(paths.bed, dir.path().join("cohort.chr1.bed"));

        let variants = vec![
            VariantRecord {
                chromosome: "1".into(),
                variant_id: "rs1".into(),
                position: 100,
                allele1: "A".into(),
                allele2: "G".into(),
            },
            VariantRecord {
                chromosome: "1".into(),
                variant_id: "rs2".into(),
                position: 200,
                allele1: "C".into(),
                allele2: "T".into(),
            },
        ];
        let samples: Vec<SampleRecord> = (0..3)
            .map(|i| SampleRecord {
                family_id: format!("F{i}"),
                individual_id: format!("I{i}"),
                paternal_id: "0".into(),
                maternal_id: "0".into(),
                sex: "1".into(),
                phenotype: "-9".into(),
            })
            .collect();
        let genotypes = matrix(array![[0u8, 1], [2, 3], [1, 1]]);

        write_manifests(&paths, &variants, &samples).unwrap();
        write_bed_file(&paths.bed, &genotypes).unwrap();

        let store = GenotypeStore::open(&prefix).unwrap();
        assert_eq!(store.variants, variants);
        assert_eq!(store.samples, samples);
        assert_eq!(store.genotypes, genotypes);
    }

    #[test]
    fn empty_bed_file_is_corrupt_not_io() {
        let dir = tempfile::tempdir().unwrap();
        let bed = dir.path().join("empty.bed");
        fs::write(&bed, b"").unwrap();
        assert!(matches!(
            decode_bed_file(&bed, 2, 1).unwrap_err(),
            GenotypeIoError::CorruptFormat { .. }
        ));
    }
}
