//! Shared test utilities for record building

use crate::{
    builder::{BuiltRecord, RecordBuilder},
    tree::MetadataTree,
    xml::{Locator, NamespaceContext, XmlDocument, DOCUMENT_NODE},
};

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn ns() -> NamespaceContext {
    NamespaceContext::iso19115_3()
}

/// Build one record from YAML text
pub fn build_record(yaml: &str) -> BuiltRecord {
    init_logging();
    let tree = MetadataTree::from_yaml_str(yaml).unwrap();
    let mut builder = RecordBuilder::with_namespaces(ns()).unwrap();
    builder.process_tree(&tree).unwrap();
    builder.build().unwrap()
}

/// Values selected by `expr`, evaluated from the document node
pub fn values(doc: &XmlDocument, expr: &str) -> Vec<String> {
    Locator::parse(expr, &ns()).unwrap().values(doc, DOCUMENT_NODE)
}

pub const LINEAGE_DOC_B: &str = r#"
identifier: doc-b
abstract: Streets of the Verniquet atlas
resourceLineage:
  - doc-a
  - e34f34cb-240a-469b-95f5-97075490505b
associatedResource:
  value: doc-a
  typeOfAssociation: largerWorkCitation
"#;
