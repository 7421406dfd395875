//! The seven per-prospect stage workers.
//!
//! Every stage is value-level retry-safe: replaying a stage on the same
//! input produces an equivalent output apart from cost and timing
//! metadata. Orchestration state lives on the engine, not the prospect.

pub mod discovery;
pub mod extract;
pub mod query;
pub mod relevance;
pub mod social;
pub mod social_meta;
pub mod verify;

/// JSON schema for a response type, handed to the LLM structured-output
/// path.
pub(crate) fn schema_of<T: schemars::JsonSchema>() -> serde_json::Value {
    let schema = schemars::gen::SchemaGenerator::default().into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}
