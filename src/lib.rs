//! # isorecord
//!
//! Composes ISO 19115-3 metadata records from loosely typed YAML trees and wires
//! cross-record references through a metadata catalog (GeoNetwork).
//!
//! ## Overview
//!
//! A batch of YAML documents describes a set of related datasets. Each document becomes one
//! XML record: every recognised field is rendered by a *composer* into a small XML fragment,
//! and fragments are spliced into a fixed base document at locations declared per composer.
//!
//! Records reference each other (lineage sources, associated resources) by their
//! batch-local `identifier`. Those names mean nothing to the catalog, which assigns its own
//! UUIDs on registration. Record creation is therefore two-phase:
//!
//! 1. **Build and register.** References to batch-local names are written as placeholders
//!    and collected as [`resolver::DeferredReference`]s. Every record is registered and the
//!    catalog's identifiers are collected in an [`resolver::IdentifierMap`].
//! 2. **Resolve and patch.** Each deferred reference becomes a
//!    [`resolver::PatchOperation`] (locator, payload, edit directive) submitted to the
//!    catalog against the owning record.
//!
//! ## Architecture
//!
//! - **[`tree`]**: metadata trees loaded from multi-document YAML
//! - **[`xml`]**: a small arena DOM, the locator language and namespace bindings
//! - **[`composer`]**: the closed registry of composer kinds and their fragment templates
//! - **[`builder`]**: `RecordBuilder`, tree traversal and fragment splicing
//! - **[`resolver`]**: deferred references, identifier map, patch operations, local edits
//! - **[`catalog`]**: the `Catalog` trait, an in-memory catalog and the GeoNetwork client
//! - **[`batch`]**: the two-phase orchestrator and its failure policy
//! - **[`audit`]**: the per-record CSV table shared by the CLI commands
//! - **[`config`]**: TOML and dotenv configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use isorecord::{
//!     batch::{BatchOrchestrator, FailurePolicy},
//!     catalog::MemoryCatalog,
//!     tree::load_file,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let trees = load_file("datasets.yaml")?;
//!     let report = BatchOrchestrator::new(MemoryCatalog::new())
//!         .with_policy(FailurePolicy::Continue)
//!         .run(&trees)
//!         .await;
//!
//!     println!("{}", report.summary());
//!     for (local_id, status) in report.failures() {
//!         println!("{local_id}: {status:?}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ### Building a single record
//!
//! ```rust
//! use isorecord::{builder::RecordBuilder, tree::MetadataTree, xml::NamespaceContext};
//!
//! let tree = MetadataTree::from_yaml_str(
//!     "identifier: verniquet\nabstract: Atlas of Paris\nresourceLineage: cadastre\n",
//! )?;
//! let mut builder = RecordBuilder::new()?;
//! builder.process_tree(&tree)?;
//! let record = builder.build()?;
//!
//! // `cadastre` is batch-local: it waits for the second phase.
//! assert_eq!(record.deferred().len(), 1);
//! let xml = record.to_xml_string(&NamespaceContext::iso19115_3())?;
//! assert!(xml.contains("Atlas of Paris"));
//! # Ok::<(), isorecord::RecordError>(())
//! ```

pub mod audit;
pub mod batch;
pub mod builder;
pub mod catalog;
pub mod composer;
pub mod config;
pub mod error;
pub mod resolver;
#[cfg(test)]
mod tests;
pub mod tree;
pub mod xml;

pub use error::*;
