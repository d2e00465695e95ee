//! Two-phase batch creation of records.
//!
//! [`BatchOrchestrator::run`] builds every record, registers every record with the catalog,
//! then resolves the deferred references against the identifiers the catalog assigned and
//! submits one patch per reference. Catalog calls are awaited one at a time.
//!
//! The [`FailurePolicy`] decides what a failure does: `Abort` stops the batch at the first
//! error, `Continue` marks the record as failed and moves on. Either way the caller gets a
//! [`BatchReport`] with the status of every record reached and the audit table.

use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

use crate::{
    audit::{AuditRow, AuditTable},
    builder::{BuiltRecord, RecordBuilder},
    catalog::Catalog,
    config::{get_content, set_content},
    error::RecordError,
    resolver::{DeferredReference, EditDirective, IdentifierMap, PatchOperation, ReferenceResolver},
    tree::MetadataTree,
    xml::NamespaceContext,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop at the first failure.
    #[default]
    Abort,
    /// Record the failure and carry on with the other records.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchPhase {
    Build,
    Register,
    Resolve,
    Patch,
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchPhase::Build => "build",
            BatchPhase::Register => "register",
            BatchPhase::Resolve => "resolve",
            BatchPhase::Patch => "patch",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    Built,
    Registered,
    /// Registered and every deferred reference patched.
    Patched,
    Failed { phase: BatchPhase, message: String },
}

impl RecordStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, RecordStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    statuses: Vec<(String, RecordStatus)>,
    audit: AuditTable,
    patches: Vec<PatchOperation>,
    error: Option<RecordError>,
}

impl BatchReport {
    fn set(&mut self, local_id: &str, status: RecordStatus) {
        match self.statuses.iter_mut().find(|(id, _)| id == local_id) {
            // A failure is final.
            Some((_, current)) if current.is_failed() => {}
            Some((_, current)) => *current = status,
            None => self.statuses.push((local_id.to_string(), status)),
        }
    }

    /// Status of every record reached, in input order.
    pub fn statuses(&self) -> &[(String, RecordStatus)] {
        &self.statuses
    }

    pub fn status(&self, local_id: &str) -> Option<&RecordStatus> {
        self.statuses
            .iter()
            .find(|(id, _)| id == local_id)
            .map(|(_, status)| status)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &RecordStatus)> {
        self.statuses
            .iter()
            .filter(|(_, status)| status.is_failed())
            .map(|(id, status)| (id.as_str(), status))
    }

    pub fn audit(&self) -> &AuditTable {
        &self.audit
    }

    pub fn into_audit(self) -> AuditTable {
        self.audit
    }

    /// Patches the catalog accepted, in submission order.
    pub fn patches(&self) -> &[PatchOperation] {
        &self.patches
    }

    /// The error that stopped an aborted batch.
    pub fn error(&self) -> Option<&RecordError> {
        self.error.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failures().next().is_none()
    }

    pub fn summary(&self) -> String {
        let count = |wanted: fn(&RecordStatus) -> bool| {
            self.statuses.iter().filter(|(_, s)| wanted(s)).count()
        };
        format!(
            "{} record(s): {} built, {} registered, {} patched, {} failed; {} patch(es) applied{}",
            self.statuses.len(),
            count(|s| matches!(s, RecordStatus::Built)),
            count(|s| matches!(s, RecordStatus::Registered)),
            count(|s| matches!(s, RecordStatus::Patched)),
            count(RecordStatus::is_failed),
            self.patches.len(),
            match &self.error {
                Some(err) => format!(" (aborted: {err})"),
                None => String::new(),
            }
        )
    }
}

/// A built record with its serialized form.
#[derive(Debug, Clone)]
pub struct SerializedRecord {
    pub record: BuiltRecord,
    pub xml: String,
    pub path: Option<PathBuf>,
}

pub struct BatchOrchestrator<C: Catalog> {
    catalog: C,
    policy: FailurePolicy,
    ns: NamespaceContext,
    output_dir: Option<PathBuf>,
}

impl<C: Catalog> BatchOrchestrator<C> {
    pub fn new(catalog: C) -> Self {
        BatchOrchestrator {
            catalog,
            policy: FailurePolicy::default(),
            ns: NamespaceContext::default(),
            output_dir: None,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_namespaces(mut self, ns: NamespaceContext) -> Self {
        self.ns = ns;
        self
    }

    /// Also write every built record to `<dir>/<identifier>.xml`.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Mark `local_id` failed, then stop or carry on according to the policy.
    fn handle_failure(
        &self,
        report: &mut BatchReport,
        local_id: &str,
        phase: BatchPhase,
        err: RecordError,
    ) -> Result<(), RecordError> {
        report.set(
            local_id,
            RecordStatus::Failed {
                phase,
                message: err.to_string(),
            },
        );
        match self.policy {
            FailurePolicy::Abort => Err(err),
            FailurePolicy::Continue => {
                tracing::warn!("{} of '{}' failed, continuing: {}", phase, local_id, err);
                Ok(())
            }
        }
    }

    /// Run the whole batch: build, register, resolve and patch.
    pub async fn run(&self, trees: &[MetadataTree]) -> BatchReport {
        let mut report = BatchReport::default();
        if let Err(err) = self.run_phases(trees, &mut report).await {
            tracing::error!("Batch aborted: {}", err);
            report.error = Some(err);
        }
        tracing::info!("{}", report.summary());
        report
    }

    async fn run_phases(
        &self,
        trees: &[MetadataTree],
        report: &mut BatchReport,
    ) -> Result<(), RecordError> {
        let built = self.build_phase(trees, report)?;
        let ids = self.register_phase(&built, report).await?;
        let deferred: Vec<DeferredReference> = built
            .iter()
            .filter(|r| ids.contains(r.record.local_id()))
            .flat_map(|r| r.record.deferred().iter().cloned())
            .collect();
        self.patch_phase(&ids, &deferred, report).await
    }

    /// Build and serialize every tree. Only the build phase; nothing reaches the catalog.
    pub fn build_all(&self, trees: &[MetadataTree]) -> (Vec<SerializedRecord>, BatchReport) {
        let mut report = BatchReport::default();
        let built = match self.build_phase(trees, &mut report) {
            Ok(built) => built,
            Err(err) => {
                report.error = Some(err);
                Vec::new()
            }
        };
        (built, report)
    }

    fn build_one(&self, tree: &MetadataTree) -> Result<SerializedRecord, RecordError> {
        let mut builder = RecordBuilder::with_namespaces(self.ns.clone())?;
        builder.process_tree(tree)?;
        let record = builder.build()?;
        let xml = record.to_xml_string(&self.ns)?;
        let path = match &self.output_dir {
            Some(dir) => {
                let path = dir.join(format!("{}.xml", record.local_id()));
                set_content(&path, &xml)?;
                Some(path)
            }
            None => None,
        };
        Ok(SerializedRecord { record, xml, path })
    }

    fn build_phase(
        &self,
        trees: &[MetadataTree],
        report: &mut BatchReport,
    ) -> Result<Vec<SerializedRecord>, RecordError> {
        tracing::info!("Building {} record(s)", trees.len());
        let mut built = Vec::with_capacity(trees.len());
        for tree in trees {
            let local_id = tree.local_id();
            if report.status(local_id).is_some() {
                self.handle_failure(
                    report,
                    local_id,
                    BatchPhase::Build,
                    RecordError::DuplicateIdentifier(local_id.to_string()),
                )?;
                continue;
            }
            match self.build_one(tree) {
                Ok(serialized) => {
                    let mut row = AuditRow::new(local_id)
                        .with_pending(serialized.record.deferred().to_vec());
                    row.xml_path = serialized.path.clone();
                    report.audit.push(row)?;
                    report.set(local_id, RecordStatus::Built);
                    built.push(serialized);
                }
                Err(err) => self.handle_failure(report, local_id, BatchPhase::Build, err)?,
            }
        }
        Ok(built)
    }

    async fn register_phase(
        &self,
        built: &[SerializedRecord],
        report: &mut BatchReport,
    ) -> Result<IdentifierMap, RecordError> {
        tracing::info!(
            "Registering {} record(s) with the {} catalog",
            built.len(),
            self.catalog.name()
        );
        let mut ids = IdentifierMap::new();
        for serialized in built {
            let local_id = serialized.record.local_id();
            match self.catalog.register(local_id, &serialized.xml).await {
                Ok(final_id) => {
                    ids.insert(local_id, final_id.as_str())?;
                    if let Some(row) = report.audit.get_mut(local_id) {
                        row.final_id = Some(final_id);
                    }
                    report.set(local_id, RecordStatus::Registered);
                }
                Err(err) => self.handle_failure(
                    report,
                    local_id,
                    BatchPhase::Register,
                    err.into_registration(local_id),
                )?,
            }
        }
        Ok(ids)
    }

    async fn patch_phase(
        &self,
        ids: &IdentifierMap,
        deferred: &[DeferredReference],
        report: &mut BatchReport,
    ) -> Result<(), RecordError> {
        tracing::info!("Resolving {} deferred reference(s)", deferred.len());
        let resolver = ReferenceResolver::with_namespaces(ids, self.ns.clone());
        let mut owners: Vec<&str> = Vec::new();
        for reference in deferred {
            if !owners.contains(&reference.owner.as_str()) {
                owners.push(&reference.owner);
            }
        }

        for owner in owners {
            let mut complete = true;
            for reference in deferred.iter().filter(|r| r.owner == owner) {
                let operation = match resolver.patch_operation(reference) {
                    Ok(operation) => operation,
                    Err(err) => {
                        complete = false;
                        self.handle_failure(report, owner, BatchPhase::Resolve, err)?;
                        continue;
                    }
                };
                match self.catalog.submit(&operation).await {
                    Ok(()) => {
                        report.audit.remove_pending(reference);
                        report.patches.push(operation);
                    }
                    Err(err) => {
                        complete = false;
                        self.handle_failure(report, owner, BatchPhase::Patch, err.into_patch(owner))?;
                    }
                }
            }
            if complete {
                report.set(owner, RecordStatus::Patched);
            }
        }
        Ok(())
    }

    /// Register every row of `table` that has an XML file but no final identifier yet.
    pub async fn register_table(&self, table: AuditTable) -> BatchReport {
        let mut report = BatchReport {
            audit: table,
            ..Default::default()
        };
        for row in report.audit.rows().to_vec() {
            if row.final_id.is_some() {
                report.set(&row.local_id, RecordStatus::Registered);
                continue;
            }
            let registered = match &row.xml_path {
                Some(path) => match get_content(path) {
                    Ok(xml) => self
                        .catalog
                        .register(&row.local_id, &xml)
                        .await
                        .map_err(|e| e.into_registration(&row.local_id)),
                    Err(err) => Err(err),
                },
                None => Err(RecordError::Usage(format!(
                    "'{}' has no XML file to register",
                    row.local_id
                ))),
            };
            match registered {
                Ok(final_id) => {
                    if let Some(entry) = report.audit.get_mut(&row.local_id) {
                        entry.final_id = Some(final_id);
                    }
                    report.set(&row.local_id, RecordStatus::Registered);
                }
                Err(err) => {
                    if let Err(err) =
                        self.handle_failure(&mut report, &row.local_id, BatchPhase::Register, err)
                    {
                        report.error = Some(err);
                        break;
                    }
                }
            }
        }
        tracing::info!("{}", report.summary());
        report
    }

    /// Resume the patch phase from a persisted audit table.
    ///
    /// Rows with a final identifier count as registered; their pending references are
    /// resolved against every final identifier in the table.
    pub async fn resume(&self, table: AuditTable) -> BatchReport {
        let ids = match table.identifier_map() {
            Ok(ids) => ids,
            Err(err) => {
                tracing::error!("Audit table is inconsistent: {}", err);
                return BatchReport {
                    audit: table,
                    error: Some(err),
                    ..Default::default()
                };
            }
        };
        let deferred: Vec<DeferredReference> = table
            .pending_references()
            .into_iter()
            .filter(|r| ids.contains(&r.owner))
            .collect();
        let mut report = BatchReport {
            audit: table,
            ..Default::default()
        };
        for row in report.audit.rows().to_vec() {
            match row.final_id {
                Some(_) => report.set(&row.local_id, RecordStatus::Registered),
                None => tracing::warn!(
                    "'{}' has no final identifier; its references stay pending",
                    row.local_id
                ),
            }
        }
        if let Err(err) = self.patch_phase(&ids, &deferred, &mut report).await {
            tracing::error!("Patch phase aborted: {}", err);
            report.error = Some(err);
        }
        tracing::info!("{}", report.summary());
        report
    }

    /// Apply the same edit to every registered record of `table`.
    pub async fn edit_all(
        &self,
        table: &AuditTable,
        locator: &str,
        payload: &str,
        directive: EditDirective,
    ) -> BatchReport {
        let mut report = BatchReport {
            audit: table.clone(),
            ..Default::default()
        };
        for row in table.rows() {
            let Some(final_id) = row.final_id.as_deref() else {
                continue;
            };
            let operation = PatchOperation {
                owner_local: row.local_id.clone(),
                owner_final: final_id.to_string(),
                field: String::new(),
                locator: locator.to_string(),
                payload: payload.to_string(),
                directive,
            };
            match self.catalog.submit(&operation).await {
                Ok(()) => {
                    report.set(&row.local_id, RecordStatus::Patched);
                    report.patches.push(operation);
                }
                Err(err) => {
                    let err = err.into_patch(&row.local_id);
                    if let Err(err) =
                        self.handle_failure(&mut report, &row.local_id, BatchPhase::Patch, err)
                    {
                        report.error = Some(err);
                        break;
                    }
                }
            }
        }
        tracing::info!("{}", report.summary());
        report
    }

    /// Delete every registered record of `table` from the catalog.
    pub async fn delete_all(&self, table: &AuditTable) -> Result<Vec<String>, RecordError> {
        let ids = table.final_ids();
        self.catalog
            .delete(&ids)
            .await
            .map_err(|e| RecordError::Patch {
                owner: format!("{} record(s)", ids.len()),
                message: e.to_string(),
            })?;
        Ok(ids)
    }
}
