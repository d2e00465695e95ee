//! Metadata trees: the loosely typed YAML input of the record builder.
//!
//! A tree is an ordered mapping of field names to scalars, mappings or sequences. Field order
//! is significant: the builder composes fragments in the order fields appear in the source
//! document.

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::error::RecordError;

/// Field holding the batch-local name of a record.
pub const IDENTIFIER_FIELD: &str = "identifier";

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataTree {
    local_id: String,
    root: Mapping,
}

impl MetadataTree {
    pub fn new(root: Mapping) -> Result<Self, RecordError> {
        let local_id = root
            .get(IDENTIFIER_FIELD)
            .and_then(scalar_to_string)
            .ok_or_else(|| RecordError::missing_field("MetadataTree", IDENTIFIER_FIELD))?;
        Ok(MetadataTree { local_id, root })
    }

    pub fn from_value(value: Value) -> Result<Self, RecordError> {
        match value {
            Value::Mapping(root) => MetadataTree::new(root),
            other => Err(RecordError::Serialization(format!(
                "a metadata tree must be a mapping, found {}",
                value_kind(&other)
            ))),
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, RecordError> {
        MetadataTree::from_value(serde_yaml::from_str(content)?)
    }

    /// The batch-local identifier of this record.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn root(&self) -> &Mapping {
        &self.root
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.root.get(field)
    }

    /// Top-level `(field, value)` pairs in document order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.root
            .iter()
            .filter_map(|(k, v)| k.as_str().map(|key| (key, v)))
    }
}

/// Parse every YAML document of a multi-document stream into a tree.
///
/// Empty documents (a trailing `---` for instance) are skipped.
pub fn load_documents(content: &str) -> Result<Vec<MetadataTree>, RecordError> {
    let mut trees = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        trees.push(MetadataTree::from_value(value)?);
    }
    tracing::debug!("Loaded {} metadata trees", trees.len());
    Ok(trees)
}

pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Vec<MetadataTree>, RecordError> {
    let path = path.as_ref();
    if !is_yaml(path) {
        return Err(RecordError::Usage(format!(
            "{path:?} is not a YAML file (expected .yml or .yaml)"
        )));
    }
    tracing::debug!("Reading {:?}", path);
    load_documents(&std::fs::read_to_string(path)?)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    )
}

/// YAML files under `dir`, sorted by path. Hidden files and directories are skipped. An
/// unreadable entry fails the whole walk.
pub fn yaml_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>, RecordError> {
    let dir = dir.as_ref();
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| !is_hidden(e) || e.path() == dir)
    {
        let path = entry?.into_path();
        if path.is_file() && is_yaml(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Load a YAML file, or every YAML file of a directory tree in path order.
pub fn load_path<P: AsRef<Path>>(path: P) -> Result<Vec<MetadataTree>, RecordError> {
    let path = path.as_ref();
    if !path.is_dir() {
        return load_file(path);
    }
    let mut trees = Vec::new();
    for file in yaml_files(path)? {
        trees.extend(load_file(&file)?);
    }
    tracing::debug!("Loaded {} tree(s) from {:?}", trees.len(), path);
    Ok(trees)
}

/// Render a scalar as the literal text written into a record. Mappings, sequences and null
/// have no scalar text.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Tagged(tagged) => scalar_to_string(&tagged.value),
        Value::Null | Value::Sequence(_) | Value::Mapping(_) => None,
    }
}

pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_requires_identifier() {
        let err = MetadataTree::from_yaml_str("title: no id here\n").unwrap_err();
        assert!(matches!(err, RecordError::MissingField { ref field, .. } if field == "identifier"));
    }

    #[test]
    fn test_fields_keep_document_order() {
        let tree = MetadataTree::from_yaml_str(
            "identifier: doc-a\nabstract: text\nscope: dataset\nkeywords: []\n",
        )
        .unwrap();
        let names: Vec<&str> = tree.fields().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["identifier", "abstract", "scope", "keywords"]);
        assert_eq!(tree.local_id(), "doc-a");
    }

    #[test]
    fn test_load_documents_skips_empty_documents() {
        let content = "identifier: a\n---\nidentifier: b\n---\n";
        let trees = load_documents(content).unwrap();
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[1].local_id(), "b");
    }

    #[test]
    fn test_scalar_to_string_keeps_literal_numbers() {
        let value: Value = serde_yaml::from_str("2.3522").unwrap();
        assert_eq!(scalar_to_string(&value).as_deref(), Some("2.3522"));
        assert_eq!(scalar_to_string(&Value::Null), None);
    }

    #[test]
    fn test_load_path_walks_yaml_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("b")).unwrap();
        std::fs::create_dir_all(dir.path().join(".drafts")).unwrap();
        std::fs::write(dir.path().join("b/two.yml"), "identifier: two\n").unwrap();
        std::fs::write(dir.path().join("a.yaml"), "identifier: one\n---\nidentifier: one-b\n").unwrap();
        std::fs::write(dir.path().join(".drafts/x.yaml"), "identifier: hidden\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "identifier: ignored\n").unwrap();

        let ids: Vec<String> = load_path(dir.path())
            .unwrap()
            .iter()
            .map(|t| t.local_id().to_string())
            .collect();
        assert_eq!(ids, vec!["one", "one-b", "two"]);
        assert!(matches!(
            load_path(dir.path().join("notes.txt")),
            Err(RecordError::Usage(_))
        ));
    }

    #[test]
    fn test_yaml_files_reports_walk_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        assert!(matches!(yaml_files(&missing), Err(RecordError::NotFound(_))));
        assert_eq!(yaml_files(dir.path()).unwrap(), Vec::<PathBuf>::new());
    }
}
