//! In-process catalog.
//!
//! Stores registered records as parsed documents, assigns UUID v4 identifiers (or preset
//! ones) and applies batch edits locally. Every call is recorded so tests can assert on the
//! exact sequence of catalog operations. A single [`FailOn`] rule injects failures.

use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};
use uuid::Uuid;

use super::{Catalog, CatalogError};
use crate::{
    resolver::{apply_edit, EditDirective},
    xml::{NamespaceContext, XmlDocument},
};

/// In-memory catalog. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryCatalog {
    inner: Arc<Mutex<MemoryCatalogInner>>,
}

#[derive(Debug)]
struct MemoryCatalogInner {
    ns: NamespaceContext,
    records: BTreeMap<String, XmlDocument>,
    /// Final identifiers to hand out by batch-local id.
    preset: HashMap<String, String>,
    fail_on: Vec<FailOn>,
    operations: Vec<CatalogOperation>,
}

/// Failure injection rule.
#[derive(Debug, Clone)]
pub enum FailOn {
    /// Fail `register` for one batch-local id, or for every record when `None`.
    Register {
        local_id: Option<String>,
        error: CatalogError,
    },
    /// Fail `patch` on one record, or on every record when `None`.
    Patch {
        owner_final: Option<String>,
        error: CatalogError,
    },
    Delete(CatalogError),
}

/// Recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogOperation {
    Register {
        local_id: String,
        final_id: String,
    },
    Patch {
        owner_final: String,
        locator: String,
        payload: String,
        directive: EditDirective,
    },
    Delete {
        final_ids: Vec<String>,
    },
}

impl MemoryCatalog {
    pub fn new() -> Self {
        MemoryCatalog::with_namespaces(NamespaceContext::default())
    }

    pub fn with_namespaces(ns: NamespaceContext) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryCatalogInner {
                ns,
                records: BTreeMap::new(),
                preset: HashMap::new(),
                fail_on: Vec::new(),
                operations: Vec::new(),
            })),
        }
    }

    /// Pre-assign final identifiers, keyed by batch-local id.
    pub fn with_preset_ids<I, K, V>(self, ids: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        {
            let mut inner = self.lock();
            inner
                .preset
                .extend(ids.into_iter().map(|(k, v)| (k.into(), v.into())));
        }
        self
    }

    pub fn fail_on(self, fail_on: FailOn) -> Self {
        self.lock().fail_on.push(fail_on);
        self
    }

    pub fn clear_fail_on(&self) {
        self.lock().fail_on.clear();
    }

    pub fn operations(&self) -> Vec<CatalogOperation> {
        self.lock().operations.clone()
    }

    /// Recorded patch calls only.
    pub fn patches(&self) -> Vec<CatalogOperation> {
        self.lock()
            .operations
            .iter()
            .filter(|op| matches!(op, CatalogOperation::Patch { .. }))
            .cloned()
            .collect()
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn contains(&self, final_id: &str) -> bool {
        self.lock().records.contains_key(final_id)
    }

    /// A copy of a stored record.
    pub fn document(&self, final_id: &str) -> Option<XmlDocument> {
        self.lock().records.get(final_id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryCatalogInner> {
        // A panicking test thread must not hide the recorded state from the others.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalogInner {
    fn register_failure(&self, local_id: &str) -> Option<CatalogError> {
        self.fail_on.iter().find_map(|rule| match rule {
            FailOn::Register { local_id: None, error } => Some(error.clone()),
            FailOn::Register {
                local_id: Some(id),
                error,
            } if id == local_id => Some(error.clone()),
            _ => None,
        })
    }

    fn patch_failure(&self, owner_final: &str) -> Option<CatalogError> {
        self.fail_on.iter().find_map(|rule| match rule {
            FailOn::Patch {
                owner_final: None,
                error,
            } => Some(error.clone()),
            FailOn::Patch {
                owner_final: Some(id),
                error,
            } if id == owner_final => Some(error.clone()),
            _ => None,
        })
    }

    fn delete_failure(&self) -> Option<CatalogError> {
        self.fail_on.iter().find_map(|rule| match rule {
            FailOn::Delete(error) => Some(error.clone()),
            _ => None,
        })
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn register(&self, local_id: &str, xml: &str) -> Result<String, CatalogError> {
        let mut inner = self.lock();
        if let Some(error) = inner.register_failure(local_id) {
            return Err(error);
        }
        let document = XmlDocument::parse(xml, &inner.ns)
            .map_err(|e| CatalogError::Rejected(format!("'{local_id}' is not a valid record: {e}")))?;
        let final_id = inner
            .preset
            .get(local_id)
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if inner.records.contains_key(&final_id) {
            return Err(CatalogError::ApiError {
                status: 409,
                message: format!("a record with uuid '{final_id}' already exists"),
            });
        }
        inner.records.insert(final_id.clone(), document);
        inner.operations.push(CatalogOperation::Register {
            local_id: local_id.to_string(),
            final_id: final_id.clone(),
        });
        tracing::debug!("[MemoryCatalog::register] '{}' -> {}", local_id, final_id);
        Ok(final_id)
    }

    async fn patch(
        &self,
        owner_final: &str,
        locator: &str,
        payload: &str,
        directive: EditDirective,
    ) -> Result<(), CatalogError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if let Some(error) = inner.patch_failure(owner_final) {
            return Err(error);
        }
        inner.operations.push(CatalogOperation::Patch {
            owner_final: owner_final.to_string(),
            locator: locator.to_string(),
            payload: payload.to_string(),
            directive,
        });
        let document = inner
            .records
            .get_mut(owner_final)
            .ok_or_else(|| CatalogError::NotFound(format!("record {owner_final}")))?;
        let edited = apply_edit(document, locator, payload, directive, &inner.ns)
            .map_err(|e| CatalogError::Rejected(e.to_string()))?;
        tracing::debug!(
            "[MemoryCatalog::patch] {} {} on {} match(es) of '{}'",
            directive,
            owner_final,
            edited,
            locator
        );
        Ok(())
    }

    async fn delete(&self, final_ids: &[String]) -> Result<(), CatalogError> {
        let mut inner = self.lock();
        if let Some(error) = inner.delete_failure() {
            return Err(error);
        }
        inner.operations.push(CatalogOperation::Delete {
            final_ids: final_ids.to_vec(),
        });
        for id in final_ids {
            if inner.records.remove(id).is_none() {
                tracing::warn!("Record {} is not in the catalog, nothing to delete", id);
            }
        }
        Ok(())
    }
}
