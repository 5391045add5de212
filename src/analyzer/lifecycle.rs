use crate::config::SymbolConfig;
use crate::model::AnalysisRecord;
use crate::normalizer::normalize_symbol;
use std::collections::BTreeMap;

/// Buckets active records by canonical symbol so each bucket is priced once.
/// Records keep their relative order inside a bucket.
pub fn group_by_symbol(
    records: Vec<AnalysisRecord>,
    symbols: &[SymbolConfig],
) -> BTreeMap<String, Vec<AnalysisRecord>> {
    let mut grouped: BTreeMap<String, Vec<AnalysisRecord>> = BTreeMap::new();

    for record in records {
        let key = normalize_symbol(&record.symbol, symbols);
        grouped.entry(key).or_default().push(record);
    }

    grouped
}
