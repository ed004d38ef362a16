use appstore_core::values::{deep_merge, inline, parse_document};
use appstore_core::{AppDeployment, Values, ValuesError, ValuesSource};
use tracing::warn;

/// Merged Helm values for `record`: every `valuesFrom` reference in order,
/// then inline `spec.values` on top. Optional references that cannot be
/// read or parsed are skipped.
pub async fn resolve_values(source: &dyn ValuesSource, record: &AppDeployment) -> Result<Values, ValuesError> {
    let ns = record.namespace_or_default();
    let mut merged = Values::new();
    for reference in &record.spec.values_from {
        let origin = format!("{}/{} key {}", reference.kind, reference.name, reference.values_key);
        let layer = match source.fetch(&ns, reference).await {
            Ok(text) => parse_document(&origin, &text),
            Err(e) => Err(e),
        };
        match layer {
            Ok(layer) => deep_merge(&mut merged, layer),
            Err(e) if reference.optional => {
                warn!(ns = %ns, reference = %origin, error = %e, "skipping optional values reference");
            }
            Err(e) => return Err(e),
        }
    }
    deep_merge(&mut merged, inline(record.spec.values.as_ref())?);
    Ok(merged)
}
