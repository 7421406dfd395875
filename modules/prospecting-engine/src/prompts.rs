//! Versioned prompt templates loaded from disk.
//!
//! Each prompt is a TOML file carrying `id`, `version`, `model_hint`, and
//! `template`. Templates use `{{var}}` placeholders. Prompts are loaded once
//! at startup and immutable for the duration of a run.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const PROMPT_QUERY_OPTIMIZATION: &str = "query_optimization";
pub const PROMPT_WEBSITE_EXTRACTION: &str = "website_extraction";
pub const PROMPT_RELEVANCE: &str = "relevance";

/// One prompt file on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptFile {
    pub id: String,
    pub version: String,
    pub model_hint: String,
    pub template: String,
}

/// Provenance snapshot attached to persisted prospects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptSnapshot {
    pub id: String,
    pub version: String,
    pub vars_hash: String,
}

#[derive(Debug, Clone)]
pub struct PromptRegistry {
    prompts: HashMap<String, PromptFile>,
}

impl PromptRegistry {
    /// Load every `*.toml` prompt file in a directory. Load-once semantics:
    /// callers keep the registry for the process lifetime.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut prompts = HashMap::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read prompts dir: {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;
            let prompt: PromptFile = toml::from_str(&content)
                .with_context(|| format!("Invalid prompt file: {}", path.display()))?;
            if prompt.template.trim().is_empty() {
                bail!("Prompt template is empty: {}", path.display());
            }
            prompts.insert(prompt.id.clone(), prompt);
        }

        if prompts.is_empty() {
            bail!("No prompt files found in {}", dir.display());
        }

        Ok(Self { prompts })
    }

    /// Build a registry from in-memory prompt definitions.
    pub fn from_prompts(files: impl IntoIterator<Item = PromptFile>) -> Self {
        Self {
            prompts: files.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /// Materialize a prompt. Placeholders left unresolved after substitution
    /// are a fatal error; extra vars are ignored.
    pub fn render(
        &self,
        id: &str,
        vars: &HashMap<&str, &str>,
    ) -> Result<(String, PromptSnapshot)> {
        let prompt = self
            .prompts
            .get(id)
            .with_context(|| format!("Unknown prompt id: {id}"))?;

        let text = substitute(&prompt.template, vars);

        if let Some(unresolved) = first_placeholder(&text) {
            bail!(
                "Unresolved template variable {{{{{unresolved}}}}} in prompt '{id}'"
            );
        }

        Ok((
            text,
            PromptSnapshot {
                id: prompt.id.clone(),
                version: prompt.version.clone(),
                vars_hash: hash_vars(vars),
            },
        ))
    }

    pub fn model_hint(&self, id: &str) -> Option<&str> {
        self.prompts.get(id).map(|p| p.model_hint.as_str())
    }

    /// `{id: version}` map for the run provenance snapshot.
    pub fn versions(&self) -> serde_json::Value {
        let map: std::collections::BTreeMap<&str, &str> = self
            .prompts
            .values()
            .map(|p| (p.id.as_str(), p.version.as_str()))
            .collect();
        serde_json::json!(map)
    }

    /// Full prompt set as JSON, for the project-level first-run lock.
    pub fn to_json(&self) -> serde_json::Value {
        let map: std::collections::BTreeMap<&str, &PromptFile> =
            self.prompts.iter().map(|(k, v)| (k.as_str(), v)).collect();
        serde_json::to_value(map).unwrap_or(serde_json::Value::Null)
    }

    /// Rebuild a registry from a stored [`Self::to_json`] value.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let map: HashMap<String, PromptFile> = serde_json::from_value(value.clone())
            .context("Invalid stored prompt set")?;
        if map.is_empty() {
            bail!("Stored prompt set is empty");
        }
        Ok(Self { prompts: map })
    }
}

/// Replace `{{var}}` placeholders from the context map.
fn substitute(template: &str, vars: &HashMap<&str, &str>) -> String {
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '{' && chars.peek() == Some(&'{') {
            chars.next();

            let mut var_name = String::new();
            loop {
                match chars.next() {
                    Some('}') if chars.peek() == Some(&'}') => {
                        chars.next();
                        break;
                    }
                    Some(ch) => var_name.push(ch),
                    None => {
                        // Malformed tail: emit what we have
                        result.push_str("{{");
                        result.push_str(&var_name);
                        return result;
                    }
                }
            }

            let var_name = var_name.trim();
            if let Some(value) = vars.get(var_name) {
                result.push_str(value);
            } else {
                // Leave unresolved so render() can reject it
                result.push_str("{{");
                result.push_str(var_name);
                result.push_str("}}");
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// First `{{...}}` placeholder remaining in a string, if any.
fn first_placeholder(text: &str) -> Option<String> {
    let start = text.find("{{")?;
    let rest = &text[start + 2..];
    let end = rest.find("}}")?;
    Some(rest[..end].trim().to_string())
}

/// Order-independent hash of the substituted variables.
fn hash_vars(vars: &HashMap<&str, &str>) -> String {
    let mut pairs: Vec<_> = vars.iter().collect();
    pairs.sort();
    let mut hasher = Sha256::new();
    for (k, v) in pairs {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PromptRegistry {
        PromptRegistry::from_prompts([PromptFile {
            id: "greeting".to_string(),
            version: "2".to_string(),
            model_hint: "claude-haiku-4-5-20251001".to_string(),
            template: "Hello {{name}}, welcome to {{place}}.".to_string(),
        }])
    }

    #[test]
    fn renders_with_all_vars() {
        let (text, snap) = registry()
            .render(
                "greeting",
                &HashMap::from([("name", "Ada"), ("place", "Philadelphia")]),
            )
            .unwrap();
        assert_eq!(text, "Hello Ada, welcome to Philadelphia.");
        assert_eq!(snap.id, "greeting");
        assert_eq!(snap.version, "2");
        assert!(!snap.vars_hash.is_empty());
    }

    #[test]
    fn unresolved_var_is_fatal() {
        let err = registry()
            .render("greeting", &HashMap::from([("name", "Ada")]))
            .unwrap_err();
        assert!(err.to_string().contains("place"));
    }

    #[test]
    fn extra_vars_are_ignored() {
        let result = registry().render(
            "greeting",
            &HashMap::from([("name", "Ada"), ("place", "PHL"), ("extra", "x")]),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn vars_hash_is_order_independent_but_value_sensitive() {
        let reg = registry();
        let (_, a) = reg
            .render("greeting", &HashMap::from([("name", "A"), ("place", "B")]))
            .unwrap();
        let (_, b) = reg
            .render("greeting", &HashMap::from([("place", "B"), ("name", "A")]))
            .unwrap();
        let (_, c) = reg
            .render("greeting", &HashMap::from([("name", "A"), ("place", "C")]))
            .unwrap();
        assert_eq!(a.vars_hash, b.vars_hash);
        assert_ne!(a.vars_hash, c.vars_hash);
    }

    #[test]
    fn unknown_prompt_id_errors() {
        assert!(registry().render("nope", &HashMap::new()).is_err());
    }

    #[test]
    fn loads_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("relevance.toml"),
            r#"
id = "relevance"
version = "1"
model_hint = "claude-haiku-4-5-20251001"
template = "Score {{company}} against the brief."
"#,
        )
        .unwrap();

        let reg = PromptRegistry::load(dir.path()).unwrap();
        let (text, _) = reg
            .render("relevance", &HashMap::from([("company", "Acme")]))
            .unwrap();
        assert_eq!(text, "Score Acme against the brief.");
        assert_eq!(
            reg.model_hint("relevance"),
            Some("claude-haiku-4-5-20251001")
        );
    }

    #[test]
    fn empty_directory_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PromptRegistry::load(dir.path()).is_err());
    }

    #[test]
    fn json_round_trip_preserves_prompts() {
        let original = registry();
        let restored = PromptRegistry::from_json(&original.to_json()).unwrap();
        let (text, snap) = restored
            .render(
                "greeting",
                &HashMap::from([("name", "Ada"), ("place", "PHL")]),
            )
            .unwrap();
        assert_eq!(text, "Hello Ada, welcome to PHL.");
        assert_eq!(snap.version, "2");
    }
}
