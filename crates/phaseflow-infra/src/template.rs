//! Workflow template files.
//!
//! Templates are stored as YAML (`.yaml`/`.yml`) or JSON (`.json`) files and
//! parsed into [`WorkflowTemplate`]s before being registered with the engine.

use std::path::{Path, PathBuf};

use phaseflow_types::template::WorkflowTemplate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("unsupported template file extension: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("invalid template: {0}")]
    Invalid(String),
}

/// Template file formats, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFormat {
    Yaml,
    Json,
}

impl TemplateFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "yaml" | "yml" => Some(TemplateFormat::Yaml),
            "json" => Some(TemplateFormat::Json),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse template text in the given format and validate it.
pub fn parse_template(content: &str, format: TemplateFormat) -> Result<WorkflowTemplate, String> {
    let template: WorkflowTemplate = match format {
        TemplateFormat::Yaml => serde_yaml_ng::from_str(content).map_err(|e| e.to_string())?,
        TemplateFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string())?,
    };
    validate_template(&template).map_err(|e| e.to_string())?;
    Ok(template)
}

/// Structural checks: a non-empty id and unique phase ids.
pub fn validate_template(template: &WorkflowTemplate) -> Result<(), TemplateError> {
    if template.id.trim().is_empty() {
        return Err(TemplateError::Invalid("template id is empty".to_string()));
    }

    if let Some(phase_id) = template.duplicate_phase_id() {
        return Err(TemplateError::Invalid(format!(
            "template '{}' has duplicate phase id '{phase_id}'",
            template.id
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a template from a YAML or JSON file.
pub fn load_template_file(path: &Path) -> Result<WorkflowTemplate, TemplateError> {
    let format = TemplateFormat::from_path(path)
        .ok_or_else(|| TemplateError::UnsupportedFormat(path.to_path_buf()))?;
    let content = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_template(&content, format).map_err(|message| TemplateError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

/// Discover all template files under `base_dir`, recursively.
///
/// Files that fail to parse are skipped with a warning. A missing directory
/// yields an empty list. Results are sorted by path.
pub fn discover_templates(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowTemplate)>, TemplateError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowTemplate)>,
) -> Result<(), TemplateError> {
    let io_err = |source| TemplateError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if TemplateFormat::from_path(&path).is_some() {
            match load_template_file(&path) {
                Ok(template) => results.push((path, template)),
                Err(err) => {
                    tracing::warn!(?path, error = %err, "skipping unparseable template file");
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const YAML: &str = r#"
id: greenfield
name: Greenfield service
sequence:
  - agent: analyst
    action: create-doc
    creates: brief.md
  - agent: pm
    uses: [brief.md]
    creates: prd.md
    validationGates: [required-artifacts]
"#;

    #[test]
    fn test_parse_yaml_template() {
        let template = parse_template(YAML, TemplateFormat::Yaml).unwrap();
        assert_eq!(template.id, "greenfield");
        assert_eq!(template.display_name(), "Greenfield service");
        assert_eq!(template.steps.len(), 2);
        assert_eq!(template.steps[1].uses, vec!["brief.md"]);
        assert_eq!(template.steps[1].validation_gates, vec!["required-artifacts"]);
    }

    #[test]
    fn test_parse_json_template() {
        let json = r#"{"id": "t1", "steps": [{"name": "A"}, {"name": "B"}]}"#;
        let template = parse_template(json, TemplateFormat::Json).unwrap();
        assert_eq!(template.steps[0].phase_id(0), "A");
    }

    #[test]
    fn test_validation_rejects_duplicate_phase_ids() {
        let yaml = "id: t\nsteps:\n  - name: A\n  - name: A\n";
        let err = parse_template(yaml, TemplateFormat::Yaml).unwrap_err();
        assert!(err.contains("duplicate phase id 'A'"));
    }

    #[test]
    fn test_validation_rejects_empty_id() {
        let err = parse_template("id: ''\nsteps: []\n", TemplateFormat::Yaml).unwrap_err();
        assert!(err.contains("template id is empty"));
    }

    #[test]
    fn test_load_template_file_by_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("greenfield.yml");
        std::fs::write(&path, YAML).unwrap();
        assert_eq!(load_template_file(&path).unwrap().id, "greenfield");

        let txt = dir.path().join("notes.txt");
        std::fs::write(&txt, "id: x").unwrap();
        assert!(matches!(
            load_template_file(&txt),
            Err(TemplateError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_discover_templates() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.yaml"), YAML).unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(
            dir.path().join("nested/b.json"),
            r#"{"id": "b", "steps": []}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "steps: {").unwrap();
        std::fs::write(dir.path().join("README.md"), "# templates").unwrap();

        let found = discover_templates(dir.path()).unwrap();
        let ids: Vec<_> = found.iter().map(|(_, t)| t.id.as_str()).collect();
        assert_eq!(ids, vec!["greenfield", "b"]);
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let found = discover_templates(Path::new("/nonexistent/phaseflow/templates")).unwrap();
        assert!(found.is_empty());
    }
}
