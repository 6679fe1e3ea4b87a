use crate::jobs::model::Stage;

/// Deterministic dedupe key for `(source_entity_id, stage)`.
///
/// Stage names contain no `/`, so the separator keeps distinct inputs from
/// colliding. No randomness, no time component: the same inputs always yield
/// the same key, and the ledger's live-key unique index turns that into
/// at-most-one live job per entity per stage.
pub fn dedupe_key(source_entity_id: &str, stage: Stage) -> String {
    format!("{}/{}", source_entity_id.trim(), stage.as_str())
}
