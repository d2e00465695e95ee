//! Audit table: one row per record of a batch.
//!
//! The table is the hand-off between CLI phases. `parse` writes it with local ids, XML paths
//! and pending references; `upload` fills in the final identifiers; `update-postponed` reads
//! it back to resume the patch phase. On disk it is a CSV file with the columns
//! `yaml_identifier,geonetwork_uuid,xml_file_path,postponed_values`, the last one holding
//! the JSON-encoded deferred references of the row. XML file paths are relative to the
//! directory holding the CSV file.

use serde::{Deserialize, Serialize};
use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
};

use crate::{
    error::RecordError,
    resolver::{DeferredReference, IdentifierMap},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditRow {
    pub local_id: String,
    pub final_id: Option<String>,
    pub xml_path: Option<PathBuf>,
    pub pending: Vec<DeferredReference>,
}

impl AuditRow {
    pub fn new(local_id: impl Into<String>) -> Self {
        AuditRow {
            local_id: local_id.into(),
            ..Default::default()
        }
    }

    pub fn with_xml_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.xml_path = Some(path.into());
        self
    }

    pub fn with_pending(mut self, pending: Vec<DeferredReference>) -> Self {
        self.pending = pending;
        self
    }
}

/// Row layout of the CSV file.
#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    yaml_identifier: String,
    geonetwork_uuid: Option<String>,
    xml_file_path: Option<String>,
    postponed_values: Option<String>,
}

impl TryFrom<&AuditRow> for CsvRow {
    type Error = RecordError;

    fn try_from(row: &AuditRow) -> Result<Self, Self::Error> {
        let postponed_values = if row.pending.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&row.pending)?)
        };
        Ok(CsvRow {
            yaml_identifier: row.local_id.clone(),
            geonetwork_uuid: row.final_id.clone(),
            xml_file_path: row
                .xml_path
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned()),
            postponed_values,
        })
    }
}

impl TryFrom<CsvRow> for AuditRow {
    type Error = RecordError;

    fn try_from(row: CsvRow) -> Result<Self, Self::Error> {
        let pending = match row.postponed_values.as_deref().map(str::trim) {
            None | Some("") => Vec::new(),
            Some(json) => serde_json::from_str(json)?,
        };
        Ok(AuditRow {
            local_id: row.yaml_identifier,
            final_id: row.geonetwork_uuid.filter(|id| !id.is_empty()),
            xml_path: row.xml_file_path.filter(|p| !p.is_empty()).map(PathBuf::from),
            pending,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditTable {
    rows: Vec<AuditRow>,
}

impl AuditTable {
    pub fn new() -> Self {
        AuditTable::default()
    }

    pub fn rows(&self) -> &[AuditRow] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [AuditRow] {
        &mut self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Add a row. Local ids are unique within a table.
    pub fn push(&mut self, row: AuditRow) -> Result<(), RecordError> {
        if self.get(&row.local_id).is_some() {
            return Err(RecordError::DuplicateIdentifier(row.local_id));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn get(&self, local_id: &str) -> Option<&AuditRow> {
        self.rows.iter().find(|row| row.local_id == local_id)
    }

    pub fn get_mut(&mut self, local_id: &str) -> Option<&mut AuditRow> {
        self.rows.iter_mut().find(|row| row.local_id == local_id)
    }

    /// Final ids of every registered row, in table order.
    pub fn final_ids(&self) -> Vec<String> {
        self.rows.iter().filter_map(|row| row.final_id.clone()).collect()
    }

    /// Copy final identifiers from `ids` into the matching rows. Returns the number of rows
    /// updated.
    pub fn apply_identifiers(&mut self, ids: &IdentifierMap) -> usize {
        let mut updated = 0;
        for row in self.rows.iter_mut() {
            if let Some(final_id) = ids.get(&row.local_id) {
                if row.final_id.as_deref() != Some(final_id) {
                    row.final_id = Some(final_id.to_string());
                    updated += 1;
                }
            }
        }
        updated
    }

    /// Rebuild the identifier map from the registered rows. Two rows sharing a final id are
    /// a `DuplicateIdentifier` error.
    pub fn identifier_map(&self) -> Result<IdentifierMap, RecordError> {
        IdentifierMap::from_pairs(
            self.rows
                .iter()
                .filter_map(|row| row.final_id.as_ref().map(|id| (row.local_id.as_str(), id.as_str()))),
        )
    }

    /// Every deferred reference still recorded in the table, in row order.
    pub fn pending_references(&self) -> Vec<DeferredReference> {
        self.rows.iter().flat_map(|row| row.pending.iter().cloned()).collect()
    }

    /// Drop a reference once its patch went through. Returns false if it was not pending.
    pub fn remove_pending(&mut self, reference: &DeferredReference) -> bool {
        let Some(row) = self.get_mut(&reference.owner) else {
            return false;
        };
        match row.pending.iter().position(|r| r == reference) {
            Some(index) => {
                row.pending.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<(), RecordError> {
        let mut csv = csv::Writer::from_writer(writer);
        if self.rows.is_empty() {
            csv.write_record([
                "yaml_identifier",
                "geonetwork_uuid",
                "xml_file_path",
                "postponed_values",
            ])?;
        }
        for row in &self.rows {
            csv.serialize(CsvRow::try_from(row)?)?;
        }
        csv.flush()?;
        Ok(())
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, RecordError> {
        let mut csv = csv::Reader::from_reader(reader);
        let mut table = AuditTable::new();
        for (index, result) in csv.deserialize::<CsvRow>().enumerate() {
            let row = result.map_err(|e| {
                RecordError::Serialization(format!("audit table row {}: {e}", index + 1))
            })?;
            table.push(AuditRow::try_from(row)?)?;
        }
        Ok(table)
    }

    /// Write the table to `path`. XML paths are stored relative to the directory of `path`
    /// when they lie under it, absolute otherwise.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), RecordError> {
        let path = path.as_ref();
        let dir = csv_dir(path);
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
        let mut stored = self.clone();
        for row in stored.rows.iter_mut() {
            if let Some(xml_path) = row.xml_path.take() {
                row.xml_path = Some(relative_to(&xml_path, dir)?);
            }
        }
        tracing::debug!("Writing audit table ({} rows) to {:?}", self.rows.len(), path);
        stored.to_writer(std::fs::File::create(path)?)
    }

    /// Read the table at `path`, resolving relative XML paths against the directory of `path`.
    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self, RecordError> {
        let path = path.as_ref();
        tracing::debug!("Reading audit table from {:?}", path);
        let mut table = AuditTable::from_reader(std::fs::File::open(path)?)?;
        let dir = csv_dir(path);
        for row in table.rows.iter_mut() {
            if let Some(xml_path) = row.xml_path.as_mut().filter(|p| p.is_relative()) {
                *xml_path = dir.join(&*xml_path);
            }
        }
        Ok(table)
    }
}

fn csv_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new(""))
}

/// `path` relative to `dir` when it lies under it, else `path` made absolute.
fn relative_to(path: &Path, dir: &Path) -> Result<PathBuf, RecordError> {
    let path = std::path::absolute(path)?;
    let dir = if dir.as_os_str().is_empty() {
        std::env::current_dir()?
    } else {
        std::path::absolute(dir)?
    };
    Ok(match path.strip_prefix(&dir) {
        Ok(relative) => relative.to_path_buf(),
        Err(_) => path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lineage(owner: &str, target: &str) -> DeferredReference {
        DeferredReference {
            owner: owner.to_string(),
            field: "resourceLineage".to_string(),
            raw_target: target.to_string(),
            association: None,
        }
    }

    fn table() -> AuditTable {
        let mut table = AuditTable::new();
        table
            .push(AuditRow::new("doc-a").with_xml_path("out/doc-a.xml"))
            .unwrap();
        table
            .push(
                AuditRow::new("doc-b")
                    .with_xml_path("out/doc-b.xml")
                    .with_pending(vec![lineage("doc-b", "doc-a")]),
            )
            .unwrap();
        table
    }

    #[test]
    fn test_csv_layout() {
        let mut buffer = Vec::new();
        table().to_writer(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("yaml_identifier,geonetwork_uuid,xml_file_path,postponed_values")
        );
        assert_eq!(lines.next(), Some("doc-a,,out/doc-a.xml,"));
        let second = lines.next().unwrap();
        assert!(second.starts_with("doc-b,,out/doc-b.xml,\"[{"), "{second}");
        assert!(second.contains("\"\"raw_target\"\":\"\"doc-a\"\""));
    }

    #[test]
    fn test_write_then_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        let mut original = table();
        original.apply_identifiers(&IdentifierMap::from_pairs([("doc-a", "id-a")]).unwrap());
        for row in original.rows_mut() {
            row.xml_path = Some(dir.path().join(format!("{}.xml", row.local_id)));
        }
        original.write_csv(&path).unwrap();
        assert_eq!(AuditTable::read_csv(&path).unwrap(), original);
    }

    #[test]
    fn test_xml_paths_are_stored_relative_to_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/records.csv");
        let mut table = table();
        table.get_mut("doc-a").unwrap().xml_path = Some(dir.path().join("out/doc-a.xml"));
        table.get_mut("doc-b").unwrap().xml_path = Some(dir.path().join("elsewhere/doc-b.xml"));
        table.write_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("doc-a,,doc-a.xml,"), "{text}");
        // Paths outside the table directory are kept absolute.
        assert!(
            text.contains(&dir.path().join("elsewhere/doc-b.xml").to_string_lossy().into_owned()),
            "{text}"
        );

        let read = AuditTable::read_csv(&path).unwrap();
        assert_eq!(
            read.get("doc-a").unwrap().xml_path.as_deref(),
            Some(dir.path().join("out/doc-a.xml").as_path())
        );

        // A hand-written table names files next to itself.
        std::fs::write(
            &path,
            "yaml_identifier,geonetwork_uuid,xml_file_path,postponed_values\nsheet-1,,sheet-1.xml,\n",
        )
        .unwrap();
        let read = AuditTable::read_csv(&path).unwrap();
        assert_eq!(
            read.get("sheet-1").unwrap().xml_path.as_deref(),
            Some(dir.path().join("out/sheet-1.xml").as_path())
        );
    }

    #[test]
    fn test_identifiers_and_pending_references() {
        let mut table = table();
        let ids = IdentifierMap::from_pairs([("doc-a", "id-a"), ("doc-b", "id-b"), ("doc-z", "id-z")]).unwrap();
        assert_eq!(table.apply_identifiers(&ids), 2);
        assert_eq!(table.apply_identifiers(&ids), 0);
        assert_eq!(table.final_ids(), vec!["id-a", "id-b"]);

        let rebuilt = table.identifier_map().unwrap();
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt.get("doc-b"), Some("id-b"));

        assert_eq!(table.pending_references(), vec![lineage("doc-b", "doc-a")]);
        assert!(table.remove_pending(&lineage("doc-b", "doc-a")));
        assert!(!table.remove_pending(&lineage("doc-b", "doc-a")));
        assert!(table.pending_references().is_empty());
    }

    #[test]
    fn test_conflicting_final_ids_fail_the_identifier_map() {
        let mut table = table();
        table.get_mut("doc-a").unwrap().final_id = Some("id-x".to_string());
        table.get_mut("doc-b").unwrap().final_id = Some("id-x".to_string());
        assert_eq!(
            table.identifier_map(),
            Err(RecordError::DuplicateIdentifier("id-x".to_string()))
        );
    }

    #[test]
    fn test_duplicate_rows_are_rejected() {
        let mut table = table();
        assert_eq!(
            table.push(AuditRow::new("doc-a")),
            Err(RecordError::DuplicateIdentifier("doc-a".to_string()))
        );
    }

    #[test]
    fn test_malformed_pending_column() {
        let text = "yaml_identifier,geonetwork_uuid,xml_file_path,postponed_values\ndoc-b,,,not json\n";
        assert!(matches!(
            AuditTable::from_reader(text.as_bytes()),
            Err(RecordError::Serialization(_))
        ));
    }
}
