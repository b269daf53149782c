//! Definition Parser
//!
//! Loads workflow and agent definitions from YAML or JSON, either from disk
//! or from an in-memory string. Every loaded definition is validated before
//! it is returned.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::Definition;
use super::validator::validate_definition;
use crate::error::{EngineError, Result};

/// Serialization format of a definition document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    /// Picks the format from a file extension; anything but `.json` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Yaml,
        }
    }
}

/// Parses and validates a definition from a string.
pub fn parse_definition(content: &str, format: Format) -> Result<Definition> {
    let definition: Definition = match format {
        Format::Yaml => serde_yaml::from_str(content).map_err(|e| {
            EngineError::InvalidDefinition(format!("failed to parse definition YAML: {}", e))
        })?,
        Format::Json => serde_json::from_str(content).map_err(|e| {
            EngineError::InvalidDefinition(format!("failed to parse definition JSON: {}", e))
        })?,
    };

    info!(
        "Parsed definition '{}' ({} steps, entry '{}')",
        definition.id,
        definition.steps.len(),
        definition.entry_step
    );

    validate_definition(&definition)?;
    Ok(definition)
}

/// Loads a definition from a YAML or JSON file.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::workflow::load_definition;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let definition = load_definition("revenue.yaml")?;
///     println!("Loaded {} steps", definition.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_definition(path: impl AsRef<Path>) -> Result<Definition> {
    let path = path.as_ref();
    info!("Loading definition from: {}", path.display());

    let content = fs::read_to_string(path)?;
    debug!("Definition content loaded ({} bytes)", content.len());

    parse_definition(&content, Format::from_path(path))
}

/// Saves a definition to a file, in the format implied by its extension.
pub fn save_definition(definition: &Definition, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let content = match Format::from_path(path) {
        Format::Yaml => serde_yaml::to_string(definition)?,
        Format::Json => serde_json::to_string_pretty(definition)?,
    };
    fs::write(path, content)?;
    info!("Definition saved to: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{OnError, Step, StepConfig};
    use tempfile::tempdir;

    const REVENUE: &str = r#"
id: revenue
name: Revenue digest
category: automation
entry_step: fetch
required_inputs: [date]
steps:
  - id: fetch
    type: external-call
    handler: echo
    dependency: ledger
    params:
      date: "{{input.date}}"
    on_error: retry
    retry:
      max_attempts: 3
      initial_delay_ms: 10
      on_exhausted: continue
  - id: done
    type: terminal
"#;

    #[test]
    fn test_parse_yaml() {
        let def = parse_definition(REVENUE, Format::Yaml).unwrap();
        assert_eq!(def.id, "revenue");
        assert_eq!(def.required_inputs, vec!["date".to_string()]);

        let fetch = def.get_step("fetch").unwrap();
        assert_eq!(fetch.on_error, OnError::Retry);
        assert_eq!(fetch.retry.as_ref().unwrap().max_attempts, 3);
        match &fetch.config {
            StepConfig::ExternalCall { dependency, .. } => {
                assert_eq!(dependency.as_deref(), Some("ledger"))
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "id": "pause",
            "entry_step": "wait",
            "steps": [{"id": "wait", "type": "delay", "duration_ms": 5}]
        }"#;
        let def = parse_definition(json, Format::Json).unwrap();
        assert_eq!(def.steps[0].config, StepConfig::Delay { duration_ms: 5 });
    }

    #[test]
    fn test_parse_rejects_invalid_structure() {
        let yaml = r#"
id: broken
entry_step: nowhere
steps:
  - id: only
    type: terminal
"#;
        let err = parse_definition(yaml, Format::Yaml).unwrap_err();
        assert_eq!(err.code(), "INVALID_DEFINITION");
    }

    #[test]
    fn test_parse_rejects_malformed_yaml() {
        let err = parse_definition("id: [unterminated", Format::Yaml).unwrap_err();
        assert_eq!(err.code(), "INVALID_DEFINITION");
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(Format::from_path(Path::new("a.json")), Format::Json);
        assert_eq!(Format::from_path(Path::new("a.JSON")), Format::Json);
        assert_eq!(Format::from_path(Path::new("a.yml")), Format::Yaml);
        assert_eq!(Format::from_path(Path::new("noext")), Format::Yaml);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("wf.json");

        let def = Definition::new("wf", "a")
            .with_step(Step::delay("a", 3))
            .with_step(Step::terminal("b"));

        save_definition(&def, &path).unwrap();
        let loaded = load_definition(&path).unwrap();
        assert_eq!(loaded, def);
    }

    #[test]
    fn test_load_definition_file_not_found() {
        let err = load_definition("/nonexistent/path/definition.yaml").unwrap_err();
        assert_eq!(err.code(), "IO_ERROR");
    }

    #[test]
    fn test_demo_definition_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/greeting.yaml");
        let def = load_definition(path).unwrap();

        assert_eq!(def.id, "greeting");
        assert_eq!(def.entry_step, "pause");
        assert_eq!(def.required_inputs, vec!["name".to_string()]);
        assert_eq!(def.handlers(), vec!["echo"]);
        assert!(def.get_step("done").unwrap().is_terminal());
    }
}
