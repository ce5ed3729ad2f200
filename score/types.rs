// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use std::fmt;

/// Normalized chromosome label used for (chromosome, position) lookups.
///
/// Genotype manifests and weight tables frequently disagree on spelling ("1" vs
/// "chr1", "x" vs "X"), so both sides are reduced to this key before matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChromosomeKey {
    Numbered(u8),
    Named(String),
}

impl ChromosomeKey {
    pub fn from_label(label: &str) -> Self {
        match parse_chromosome_label(label) {
            Ok(n) => ChromosomeKey::Numbered(n),
            Err(_) => {
                let trimmed = label.trim();
                let stripped = if trimmed.len() >= 3 && trimmed[..3].eq_ignore_ascii_case("chr") {
                    &trimmed[3..]
                } else {
                    trimmed
                };
                ChromosomeKey::Named(stripped.to_ascii_uppercase())
            }
        }
    }
}

impl fmt::Display for ChromosomeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChromosomeKey::Numbered(23) => f.write_str("X"),
            ChromosomeKey::Numbered(24) => f.write_str("Y"),
            ChromosomeKey::Numbered(25) => f.write_str("MT"),
            ChromosomeKey::Numbered(n) => write!(f, "{n}"),
            ChromosomeKey::Named(s) => f.write_str(s),
        }
    }
}

pub fn parse_chromosome_label(chr_str: &str) -> Result<u8, String> {
    let mut trimmed = chr_str.trim();

    if trimmed.len() >= 3 && trimmed[..3].eq_ignore_ascii_case("chr") {
        trimmed = &trimmed[3..];
    }

    if trimmed.eq_ignore_ascii_case("X") {
        return Ok(23);
    }
    if trimmed.eq_ignore_ascii_case("Y") {
        return Ok(24);
    }
    if trimmed.eq_ignore_ascii_case("MT") {
        return Ok(25);
    }

    trimmed.parse::<u8>().map_err(|_| {
        format!(
            "Invalid chromosome format '{}'. Expected a number, 'X', 'Y', 'MT', or 'chr' prefix.",
            chr_str.trim()
        )
    })
}

/// The primitive key used for the positional fallback match.
pub type LocusKey = (ChromosomeKey, u64);

/// One row of the variant manifest (`.bim`). Row order is genotype-matrix column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantRecord {
    pub chromosome: String,
    pub variant_id: String,
    pub position: u64,
    pub allele1: String,
    pub allele2: String,
}

impl VariantRecord {
    #[inline]
    pub fn locus_key(&self) -> LocusKey {
        (ChromosomeKey::from_label(&self.chromosome), self.position)
    }
}

/// One row of the sample manifest (`.fam`). Row order is genotype-matrix row order.
///
/// The phenotype is kept as the raw token so it can be carried through to the
/// score artifact byte-for-byte; it is only interpreted at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    pub family_id: String,
    pub individual_id: String,
    pub paternal_id: String,
    pub maternal_id: String,
    pub sex: String,
    pub phenotype: String,
}

/// One row of an externally produced effect-weight table.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightRecord {
    pub chromosome: String,
    pub variant_id: String,
    pub position: u64,
    pub allele1: String,
    pub allele2: String,
    pub weight: f64,
}

impl WeightRecord {
    #[inline]
    pub fn locus_key(&self) -> LocusKey {
        (ChromosomeKey::from_label(&self.chromosome), self.position)
    }
}

// ========================================================================================
//                            Primitive Type Definitions
// ========================================================================================

/// An index into the variant manifest, and therefore a column of the genotype matrix.
///
/// This newtype prevents confusion between different index spaces at compile time.
/// The `#[repr(transparent)]` attribute guarantees this is a zero-cost abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BimRowIndex(pub usize);

/// An index into the weight table, used for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct WeightRowIndex(pub usize);

/// The raw 2-bit genotype code stored in a packed genotype matrix.
pub const MISSING_GENOTYPE: u8 = 3;

/// One successfully matched weight record: which genotype column it reads and the
/// effect weight applied to it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignedVariant {
    pub column: BimRowIndex,
    pub weight: f64,
}

/// The ordered output of the variant matcher.
///
/// Invariant: every `column` appears at most once. Order is weight-table order,
/// which the score calculator relies on for reproducible summation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchedAlignment {
    entries: Vec<AlignedVariant>,
}

impl MatchedAlignment {
    /// Only the matcher builds alignments, which is what guarantees column exclusivity.
    pub(crate) fn from_entries(entries: Vec<AlignedVariant>) -> Self {
        Self { entries }
    }

    #[inline]
    pub fn entries(&self) -> &[AlignedVariant] {
        &self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = BimRowIndex> + '_ {
        self.entries.iter().map(|e| e.column)
    }

    pub fn weights(&self) -> impl Iterator<Item = f64> + '_ {
        self.entries.iter().map(|e| e.weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_chromosome_label_supports_common_variants() {
        assert_eq!(parse_chromosome_label("1").unwrap(), 1);
        assert_eq!(parse_chromosome_label("chr2").unwrap(), 2);
        assert_eq!(parse_chromosome_label("chrX").unwrap(), 23);
        assert_eq!(parse_chromosome_label("MT").unwrap(), 25);
    }

    #[test]
    fn chromosome_keys_agree_across_spellings() {
        assert_eq!(ChromosomeKey::from_label("1"), ChromosomeKey::from_label("chr1"));
        assert_eq!(ChromosomeKey::from_label("x"), ChromosomeKey::from_label("chrX"));
        assert_eq!(
            ChromosomeKey::from_label("chrUn_gl000220"),
            ChromosomeKey::Named("UN_GL000220".to_string())
        );
        assert_ne!(ChromosomeKey::from_label("1"), ChromosomeKey::from_label("2"));
    }

    #[test]
    fn chromosome_key_display_uses_conventional_names() {
        assert_eq!(ChromosomeKey::Numbered(23).to_string(), "X");
        assert_eq!(ChromosomeKey::Numbered(7).to_string(), "7");
        assert_eq!(ChromosomeKey::from_label("chr6_cox").to_string(), "6_COX");
    }
}
