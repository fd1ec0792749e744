//! Loads machine definitions from a directory of documents.

use crate::error::StorageError;
use fsmkit_core::{CoreError, HandlerTable, MachineDefinition, MachineDefinitionRaw, Registry};
use std::fs;
use std::path::{Path, PathBuf};

/// Reads `*.json`, `*.yaml` and `*.yml` definition documents.
#[derive(Debug, Clone)]
pub struct DefinitionLoader {
    dir: PathBuf,
    handlers: HandlerTable,
}

impl DefinitionLoader {
    pub fn new(dir: impl AsRef<Path>, handlers: HandlerTable) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            handlers,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Parses every document in the directory, sorted by file name.
    ///
    /// A missing directory yields no definitions. The first invalid document
    /// fails the whole load.
    pub fn load(&self) -> Result<Vec<MachineDefinition>, StorageError> {
        if !self.dir.exists() {
            tracing::warn!(dir = %self.dir.display(), "definition directory does not exist");
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && document_format(&path).is_some() {
                paths.push(path);
            }
        }
        paths.sort();

        paths
            .iter()
            .map(|path| load_definition(path, &self.handlers))
            .collect()
    }

    /// Loads every document and registers it. Returns the number registered.
    pub fn load_into(&self, registry: &Registry) -> Result<usize, StorageError> {
        let definitions = self.load()?;
        let count = definitions.len();

        for definition in definitions {
            registry.register(definition)?;
        }

        tracing::info!(dir = %self.dir.display(), count, "loaded machine definitions");
        Ok(count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentFormat {
    Json,
    Yaml,
}

fn document_format(path: &Path) -> Option<DocumentFormat> {
    match path.extension()?.to_str()? {
        "json" => Some(DocumentFormat::Json),
        "yaml" | "yml" => Some(DocumentFormat::Yaml),
        _ => None,
    }
}

/// Parses a single definition document.
pub fn load_definition(
    path: &Path,
    handlers: &HandlerTable,
) -> Result<MachineDefinition, StorageError> {
    let text = fs::read_to_string(path)?;

    let parsed: Result<MachineDefinitionRaw, String> = match document_format(path) {
        Some(DocumentFormat::Yaml) => serde_yaml::from_str(&text).map_err(|e| e.to_string()),
        _ => serde_json::from_str(&text).map_err(|e| e.to_string()),
    };

    parsed
        .map_err(|reason| CoreError::DefinitionInvalid { reason })
        .and_then(|raw| MachineDefinition::from_raw(raw, handlers))
        .map_err(|source| StorageError::Definition {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DOC_JSON: &str = r#"{
        "id": "doc",
        "states": ["DRAFT", "REVIEW", "APPROVED"],
        "initial": "DRAFT",
        "end_states": ["APPROVED"],
        "transitions": [
            {"from": "DRAFT", "event": "submit", "to": "REVIEW"},
            {"from": "REVIEW", "event": "approve", "to": "APPROVED", "action": "stamp"}
        ]
    }"#;

    const TICKET_YAML: &str = r#"
id: ticket
states: [open, closed]
initial: open
end_states: [closed]
transitions:
  - from: open
    event: close
    to: closed
    guard: "event.resolution == \"fixed\""
"#;

    fn handlers() -> HandlerTable {
        HandlerTable::new().with_action("stamp", |_| Ok(()))
    }

    #[test]
    fn test_load_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b_doc.json"), DOC_JSON).unwrap();
        fs::write(dir.path().join("a_ticket.yml"), TICKET_YAML).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loader = DefinitionLoader::new(dir.path(), handlers());
        let ids: Vec<String> = loader
            .load()
            .unwrap()
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(ids, vec!["ticket", "doc"]);

        let registry = Registry::new();
        assert_eq!(loader.load_into(&registry).unwrap(), 2);
        assert_eq!(registry.machine_ids(), vec!["doc", "ticket"]);
    }

    #[test]
    fn test_missing_directory() {
        let dir = TempDir::new().unwrap();
        let loader = DefinitionLoader::new(dir.path().join("absent"), HandlerTable::new());
        assert!(loader.load().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_document_names_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("doc.json"), DOC_JSON).unwrap();

        // "stamp" is not registered.
        let loader = DefinitionLoader::new(dir.path(), HandlerTable::new());
        let err = loader.load().unwrap_err();
        assert!(matches!(err, StorageError::Definition { .. }));
        assert!(err.to_string().contains("doc.json"));
        assert!(err.to_string().contains("unknown action 'stamp'"));
    }

    #[test]
    fn test_malformed_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.yaml");
        fs::write(&path, "id: [unclosed").unwrap();

        let err = load_definition(&path, &HandlerTable::new()).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Definition {
                source: CoreError::DefinitionInvalid { .. },
                ..
            }
        ));
        assert!(err.to_string().contains("broken.yaml"));
    }
}
