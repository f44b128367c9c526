//! Typed reads over flattened metafields.
//!
//! Every helper returns `None` for a missing key or an unusable value; a bad
//! value is never coerced to zero or false.

use crate::catalog::assemble::MetafieldRecord;
use crate::catalog::types::Metafields;

/// Flatten metafield records into a key -> value map. Later keys win.
pub fn flatten(records: &[MetafieldRecord]) -> Metafields {
    let mut out = Metafields::new();
    for rec in records {
        if let Some(value) = &rec.value {
            out.insert(rec.key.clone(), value.clone());
        }
    }
    out
}

pub fn float(metafields: &Metafields, key: &str) -> Option<f64> {
    let parsed = metafields.get(key)?.trim().parse::<f64>().ok()?;
    parsed.is_finite().then_some(parsed)
}

pub fn boolean(metafields: &Metafields, key: &str) -> Option<bool> {
    let value = metafields.get(key)?.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

pub fn string(metafields: &Metafields, key: &str) -> Option<String> {
    let value = metafields.get(key)?.trim();
    (!value.is_empty()).then(|| value.to_string())
}
