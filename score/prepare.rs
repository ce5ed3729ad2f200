// ========================================================================================
//
//               The variant matcher
//
// ========================================================================================
//
// This module reconciles an externally produced weight table against the variant
// manifest of a genotype fileset. Weight sources and genotype sources routinely
// disagree on identifiers across reference builds, so every weight record is tried
// by identifier first and by (chromosome, position) second. Records matching
// neither are counted, never fatal.

use crate::types::{
    AlignedVariant, BimRowIndex, LocusKey, MatchedAlignment, VariantRecord, WeightRecord,
    WeightRowIndex,
};
use ahash::AHashMap;
use log::{info, warn};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// The number of unmatched weight identifiers kept for diagnostic reporting.
const DIAGNOSTIC_BUFFER_SIZE: usize = 10;

/// Counters describing one matcher invocation. Partial matching is expected, so
/// this is reported alongside a successful result rather than as an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchReport {
    /// Number of rows in the weight table.
    pub total_weight_records: usize,
    /// Number of rows that produced an alignment entry.
    pub matched: usize,
    pub matched_by_id: usize,
    pub matched_by_position: usize,
    /// Rows whose identifier and locus were both absent from the manifest.
    pub unmatched: usize,
    /// Rows that resolved to a genotype column an earlier row already consumed.
    pub duplicate_column: usize,
    /// Matched rows whose allele pair disagrees with the manifest's pair.
    pub allele_mismatches: usize,
    /// Manifest rows whose identifier or locus shadowed an earlier row.
    pub duplicate_manifest_keys: usize,
    /// The first few unmatched identifiers, in weight-table order.
    pub first_unmatched: Vec<String>,
}

impl MatchReport {
    fn add_unmatched(&mut self, row: WeightRowIndex, variant_id: &str) {
        self.unmatched += 1;
        if self.first_unmatched.len() < DIAGNOSTIC_BUFFER_SIZE {
            self.first_unmatched
                .push(format!("{variant_id} (weight row {})", row.0 + 1));
        }
    }
}

impl Display for MatchReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Matched {} of {} weight records ({} by id, {} by chromosome:position).",
            self.matched, self.total_weight_records, self.matched_by_id, self.matched_by_position
        )?;
        if self.unmatched > 0 {
            writeln!(f, "Unmatched weight records: {}", self.unmatched)?;
            for id in &self.first_unmatched {
                writeln!(f, "  - {id}")?;
            }
        }
        if self.duplicate_column > 0 {
            writeln!(
                f,
                "Dropped {} weight records mapping to an already matched variant.",
                self.duplicate_column
            )?;
        }
        if self.allele_mismatches > 0 {
            writeln!(
                f,
                "{} matched records carry alleles that differ from the genotype manifest.",
                self.allele_mismatches
            )?;
        }
        Ok(())
    }
}

/// The alignment plus the diagnostics gathered while building it.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub alignment: MatchedAlignment,
    pub report: MatchReport,
}

/// Aligns weight records to genotype-matrix columns.
///
/// Each weight record, in table order, is looked up by identifier and then by
/// (chromosome, position). The first record to claim a column keeps it; later
/// records resolving to the same column are dropped. Lookup tables live only for
/// the duration of this call.
pub fn match_weights_to_variants(
    variants: &[VariantRecord],
    weights: &[WeightRecord],
) -> MatchOutcome {
    let mut report = MatchReport {
        total_weight_records: weights.len(),
        ..MatchReport::default()
    };

    let mut id_to_column: AHashMap<&str, BimRowIndex> = AHashMap::with_capacity(variants.len());
    let mut locus_to_column: AHashMap<LocusKey, BimRowIndex> =
        AHashMap::with_capacity(variants.len());
    for (i, variant) in variants.iter().enumerate() {
        // Later manifest rows overwrite earlier ones.
        if id_to_column
            .insert(variant.variant_id.as_str(), BimRowIndex(i))
            .is_some()
        {
            report.duplicate_manifest_keys += 1;
        }
        if locus_to_column
            .insert(variant.locus_key(), BimRowIndex(i))
            .is_some()
        {
            report.duplicate_manifest_keys += 1;
        }
    }

    let mut consumed = vec![false; variants.len()];
    let mut entries = Vec::with_capacity(weights.len().min(variants.len()));

    for (row, record) in weights.iter().enumerate() {
        let (column, by_id) = match id_to_column.get(record.variant_id.as_str()) {
            Some(&column) => (column, true),
            None => match locus_to_column.get(&record.locus_key()) {
                Some(&column) => (column, false),
                None => {
                    report.add_unmatched(WeightRowIndex(row), &record.variant_id);
                    continue;
                }
            },
        };

        if consumed[column.0] {
            report.duplicate_column += 1;
            continue;
        }
        consumed[column.0] = true;

        if by_id {
            report.matched_by_id += 1;
        } else {
            report.matched_by_position += 1;
        }
        if !same_allele_pair(&variants[column.0], record) {
            report.allele_mismatches += 1;
        }

        entries.push(AlignedVariant {
            column,
            weight: record.weight,
        });
    }

    report.matched = entries.len();

    if report.duplicate_manifest_keys > 0 {
        warn!(
            "Variant manifest contains {} duplicated identifiers or loci; the later row wins.",
            report.duplicate_manifest_keys
        );
    }
    info!(
        "Matched {} SNPs out of {} weights",
        report.matched, report.total_weight_records
    );
    if report.matched == 0 && report.total_weight_records > 0 {
        warn!("No weight record matched the genotype manifest; all scores will be zero.");
    }

    MatchOutcome {
        alignment: MatchedAlignment::from_entries(entries),
        report,
    }
}

/// Compares allele pairs as unordered, case-insensitive sets.
fn same_allele_pair(variant: &VariantRecord, record: &WeightRecord) -> bool {
    let eq = |a: &str, b: &str| a.eq_ignore_ascii_case(b);
    (eq(&variant.allele1, &record.allele1) && eq(&variant.allele2, &record.allele2))
        || (eq(&variant.allele1, &record.allele2) && eq(&variant.allele2, &record.allele1))
}
