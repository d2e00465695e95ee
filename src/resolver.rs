//! Second phase of record creation: rewriting cross-record references once every record has
//! its final identifier.
//!
//! While building, a reference composer whose target is a batch-local identifier leaves a
//! placeholder in its record and a [`DeferredReference`] on the builder. After registration the
//! [`IdentifierMap`] knows every final identifier, and the [`ReferenceResolver`] turns each
//! deferred reference into a [`PatchOperation`]: a locator addressing the placeholder's
//! container, a payload rendered with the resolved target, and a fixed [`EditDirective`].

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use uuid::{Uuid, Variant, Version};

use crate::{
    composer::{Composer, ComposerKind},
    error::RecordError,
    xml::{Locator, NamespaceContext, NodeId, XmlDocument},
};

/// True when `text` is a final catalog identifier: a random (version 4, RFC 4122 variant) UUID
/// in canonical lowercase hyphenated form.
pub fn is_final_identifier(text: &str) -> bool {
    Uuid::parse_str(text)
        .map(|id| {
            id.get_version() == Some(Version::Random)
                && id.get_variant() == Variant::RFC4122
                && id.hyphenated().to_string() == text
        })
        .unwrap_or(false)
}

/// GeoNetwork batch-edit modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditDirective {
    /// Insert the payload unless an element of the same name already exists.
    Create,
    /// Append the payload alongside existing content.
    Add,
    /// Substitute the content of each match by the payload.
    Replace,
    /// Remove each match.
    Delete,
}

impl EditDirective {
    pub fn tag(&self) -> &'static str {
        match self {
            EditDirective::Create => "gn_create",
            EditDirective::Add => "gn_add",
            EditDirective::Replace => "gn_replace",
            EditDirective::Delete => "gn_delete",
        }
    }

    /// Wrap a payload for transmission, e.g. `<gn_add>payload</gn_add>`.
    pub fn wrap(&self, payload: &str) -> String {
        format!("<{tag}>{payload}</{tag}>", tag = self.tag())
    }
}

impl fmt::Display for EditDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EditDirective::Create => "create",
            EditDirective::Add => "add",
            EditDirective::Replace => "replace",
            EditDirective::Delete => "delete",
        };
        write!(f, "{name}")
    }
}

impl FromStr for EditDirective {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(EditDirective::Create),
            "add" => Ok(EditDirective::Add),
            "replace" => Ok(EditDirective::Replace),
            "delete" => Ok(EditDirective::Delete),
            other => Err(RecordError::Usage(format!(
                "unknown edit directive '{other}' (expected create, add, replace or delete)"
            ))),
        }
    }
}

/// A cross-record reference whose target was not a final identifier at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredReference {
    /// Batch-local identifier of the record holding the reference.
    pub owner: String,
    /// Tree field that produced the reference (`resourceLineage`, `associatedResource`).
    pub field: String,
    /// The unresolved batch-local identifier of the target.
    pub raw_target: String,
    /// Extra parameter needed to re-render the reference (association type).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association: Option<String>,
}

impl DeferredReference {
    pub fn kind(&self) -> Result<ComposerKind, RecordError> {
        ComposerKind::from_field(&self.field)
            .filter(|kind| kind.is_reference())
            .ok_or_else(|| {
                RecordError::Usage(format!(
                    "field '{}' of '{}' does not hold cross-record references",
                    self.field, self.owner
                ))
            })
    }
}

/// Append-only, one-to-one map from batch-local identifiers to final catalog identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentifierMap(BTreeMap<String, String>);

impl IdentifierMap {
    pub fn new() -> Self {
        IdentifierMap::default()
    }

    /// Build a map from pairs, failing on the first repeated local or final identifier.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, RecordError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = IdentifierMap::new();
        for (local_id, final_id) in pairs {
            map.insert(local_id, final_id)?;
        }
        Ok(map)
    }

    /// Record the final identifier of `local_id`. Each local identifier is written once and
    /// no two local identifiers share a final identifier.
    pub fn insert(
        &mut self,
        local_id: impl Into<String>,
        final_id: impl Into<String>,
    ) -> Result<(), RecordError> {
        let local_id = local_id.into();
        let final_id = final_id.into();
        if self.0.contains_key(&local_id) {
            return Err(RecordError::DuplicateIdentifier(local_id));
        }
        if let Some((other, _)) = self.0.iter().find(|(_, existing)| **existing == final_id) {
            tracing::debug!(
                "[IdentifierMap::insert] {} already assigned to '{}'",
                final_id,
                other
            );
            return Err(RecordError::DuplicateIdentifier(final_id));
        }
        self.0.insert(local_id, final_id);
        Ok(())
    }

    pub fn get(&self, local_id: &str) -> Option<&str> {
        self.0.get(local_id).map(String::as_str)
    }

    pub fn contains(&self, local_id: &str) -> bool {
        self.0.contains_key(local_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A follow-up edit of a registered record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub owner_local: String,
    pub owner_final: String,
    pub field: String,
    pub locator: String,
    pub payload: String,
    pub directive: EditDirective,
}

impl PatchOperation {
    /// The payload wrapped in its directive tag, as sent to the catalog.
    pub fn wrapped_payload(&self) -> String {
        self.directive.wrap(&self.payload)
    }
}

pub struct ReferenceResolver<'a> {
    ids: &'a IdentifierMap,
    ns: NamespaceContext,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(ids: &'a IdentifierMap) -> Self {
        ReferenceResolver::with_namespaces(ids, NamespaceContext::default())
    }

    pub fn with_namespaces(ids: &'a IdentifierMap, ns: NamespaceContext) -> Self {
        ReferenceResolver { ids, ns }
    }

    /// The final identifier of the reference's target.
    pub fn resolve(&self, reference: &DeferredReference) -> Result<&'a str, RecordError> {
        self.ids
            .get(&reference.raw_target)
            .ok_or_else(|| RecordError::UnresolvedReference {
                owner: reference.owner.clone(),
                target: reference.raw_target.clone(),
            })
    }

    pub fn patch_operation(
        &self,
        reference: &DeferredReference,
    ) -> Result<PatchOperation, RecordError> {
        let owner_final = self
            .ids
            .get(&reference.owner)
            .ok_or_else(|| RecordError::UnresolvedReference {
                owner: reference.owner.clone(),
                target: reference.owner.clone(),
            })?;
        let target = self.resolve(reference)?;
        let kind = reference.kind()?;
        let spec = kind.spec().reference.ok_or_else(|| {
            RecordError::Usage(format!("{} does not hold references", kind.type_name()))
        })?;

        let literal = quote_literal(&reference.raw_target).ok_or_else(|| RecordError::Locator {
            locator: spec.attachment.to_string(),
            message: format!(
                "identifier '{}' mixes single and double quotes",
                reference.raw_target
            ),
        })?;
        let locator = format!("{}[{}={}]", spec.attachment, spec.discriminator, literal);
        // Validate before handing the locator to a catalog.
        Locator::parse(&locator, &self.ns)?;

        let fragment = Composer::for_reference(kind, target, reference.association.as_deref())?
            .render(&self.ns)?;
        let fragment_root = fragment
            .root()
            .ok_or_else(|| RecordError::Xml(format!("empty {} fragment", kind.type_name())))?;
        let payload_node = match spec.payload {
            None => fragment_root,
            Some(path) => Locator::parse(path, &self.ns)?
                .select(&fragment, fragment_root)
                .first()
                .copied()
                .ok_or_else(|| RecordError::TemplateMismatch {
                    composer: kind.type_name().to_string(),
                    key: "payload".to_string(),
                    locator: path.to_string(),
                })?,
        };
        let payload = fragment.subtree_to_string(payload_node, &self.ns)?;

        tracing::debug!(
            "[ReferenceResolver] {} -> {} ({}): {} at {}",
            reference.owner,
            target,
            spec.directive,
            payload,
            locator
        );
        Ok(PatchOperation {
            owner_local: reference.owner.clone(),
            owner_final: owner_final.to_string(),
            field: reference.field.clone(),
            locator,
            payload,
            directive: spec.directive,
        })
    }

    /// One patch operation per reference held by `owner`.
    pub fn patch_operations(
        &self,
        owner: &str,
        references: &[DeferredReference],
    ) -> Result<Vec<PatchOperation>, RecordError> {
        references
            .iter()
            .filter(|r| r.owner == owner)
            .map(|r| self.patch_operation(r))
            .collect()
    }
}

fn quote_literal(text: &str) -> Option<String> {
    if !text.contains('\'') {
        Some(format!("'{text}'"))
    } else if !text.contains('"') {
        Some(format!("\"{text}\""))
    } else {
        None
    }
}

/// Apply an edit to a local copy of a record, mirroring the catalog's batch-edit semantics.
///
/// The locator is evaluated from the root element. A locator ending in an attribute step
/// edits that attribute (`Replace` sets it to the payload text, `Delete` removes it). A payload
/// that does not start with `<` is treated as text. Returns the number of matched nodes.
pub fn apply_edit(
    doc: &mut XmlDocument,
    locator: &str,
    payload: &str,
    directive: EditDirective,
    ns: &NamespaceContext,
) -> Result<usize, RecordError> {
    let patch_err = |message: String| RecordError::Patch {
        owner: locator.to_string(),
        message,
    };
    let root = doc
        .root()
        .ok_or_else(|| patch_err("document has no root element".to_string()))?;
    let parsed = Locator::parse(locator, ns)?;
    let matches = parsed.select(doc, root);
    if matches.is_empty() {
        return Err(patch_err(format!("no match for '{locator}'")));
    }

    if let Some(attribute) = parsed.attribute() {
        for node in &matches {
            match directive {
                EditDirective::Replace => doc.set_attribute(*node, attribute, payload.trim())?,
                EditDirective::Delete => doc.remove_attribute(*node, attribute)?,
                EditDirective::Create | EditDirective::Add => {
                    return Err(patch_err(format!(
                        "{directive} is not supported on attribute '{attribute}'"
                    )))
                }
            }
        }
        return Ok(matches.len());
    }

    if directive == EditDirective::Delete {
        for node in &matches {
            doc.detach(*node)?;
        }
        return Ok(matches.len());
    }

    let trimmed = payload.trim();
    if !trimmed.starts_with('<') {
        if directive != EditDirective::Replace {
            return Err(patch_err(format!("{directive} requires an XML payload")));
        }
        for node in &matches {
            doc.set_text(*node, trimmed)?;
        }
        return Ok(matches.len());
    }

    let fragment = XmlDocument::parse(trimmed, ns)?;
    let fragment_root = fragment
        .root()
        .ok_or_else(|| patch_err("empty payload".to_string()))?;
    let payload_name = fragment.name(fragment_root).unwrap_or_default().to_string();

    for node in &matches {
        match directive {
            EditDirective::Create => {
                let exists = doc
                    .element_children(*node)
                    .into_iter()
                    .any(|child| doc.name(child) == Some(payload_name.as_str()));
                if exists {
                    continue;
                }
            }
            EditDirective::Replace => {
                let children: Vec<NodeId> = doc.children(*node).to_vec();
                for child in children {
                    doc.detach(child)?;
                }
            }
            EditDirective::Add | EditDirective::Delete => {}
        }
        let copy = doc.import(&fragment, fragment_root)?;
        doc.append_child(*node, copy)?;
    }
    Ok(matches.len())
}

/// Apply a [`PatchOperation`] to a local copy of its owner record.
pub fn apply_patch(
    doc: &mut XmlDocument,
    patch: &PatchOperation,
    ns: &NamespaceContext,
) -> Result<usize, RecordError> {
    apply_edit(doc, &patch.locator, &patch.payload, patch.directive, ns).map_err(|e| match e {
        RecordError::Patch { message, .. } => RecordError::Patch {
            owner: patch.owner_local.clone(),
            message,
        },
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::DOCUMENT_NODE;

    const OWNER: &str = r#"<mdb:MD_Metadata>
  <mdb:identificationInfo>
    <mri:MD_DataIdentification>
      <mri:associatedResource>
        <mri:MD_AssociatedResource>
          <mri:associationType>
            <mri:DS_AssociationTypeCode codeListValue="isComposedOf"/>
          </mri:associationType>
          <mri:metadataReference uuidref="doc-a"/>
        </mri:MD_AssociatedResource>
      </mri:associatedResource>
    </mri:MD_DataIdentification>
  </mdb:identificationInfo>
  <mdb:resourceLineage>
    <mrl:LI_Lineage>
      <mrl:source uuidref="doc-a"/>
    </mrl:LI_Lineage>
  </mdb:resourceLineage>
</mdb:MD_Metadata>"#;

    fn ids() -> IdentifierMap {
        let mut ids = IdentifierMap::new();
        ids.insert("doc-A", "id-123").unwrap();
        ids.insert("doc-B", "id-456").unwrap();
        ids
    }

    fn lineage(owner: &str, target: &str) -> DeferredReference {
        DeferredReference {
            owner: owner.to_string(),
            field: "resourceLineage".to_string(),
            raw_target: target.to_string(),
            association: None,
        }
    }

    fn values(doc: &XmlDocument, expr: &str) -> Vec<String> {
        Locator::parse(expr, &NamespaceContext::iso19115_3())
            .unwrap()
            .values(doc, DOCUMENT_NODE)
    }

    #[test]
    fn test_final_identifier_check() {
        assert!(is_final_identifier("e34f34cb-240a-469b-95f5-97075490505b"));
        assert!(!is_final_identifier("E34F34CB-240A-469B-95F5-97075490505B"));
        assert!(!is_final_identifier("e34f34cb240a469b95f597075490505b"));
        assert!(!is_final_identifier("{e34f34cb-240a-469b-95f5-97075490505b}"));
        assert!(!is_final_identifier("doc-a"));
        // Only random UUIDs with the RFC 4122 variant are catalog identifiers.
        assert!(!is_final_identifier("e34f34cb-240a-169b-95f5-97075490505b"));
        assert!(!is_final_identifier("e34f34cb-240a-569b-95f5-97075490505b"));
        assert!(!is_final_identifier("e34f34cb-240a-469b-c5f5-97075490505b"));
        assert!(!is_final_identifier("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_identifier_map_is_append_only() {
        let mut ids = IdentifierMap::new();
        ids.insert("doc-a", "id-1").unwrap();
        assert_eq!(
            ids.insert("doc-a", "id-2").unwrap_err(),
            RecordError::DuplicateIdentifier("doc-a".to_string())
        );
        assert_eq!(ids.get("doc-a"), Some("id-1"));
        assert_eq!(
            ids.insert("doc-b", "id-1").unwrap_err(),
            RecordError::DuplicateIdentifier("id-1".to_string())
        );
        assert_eq!(ids.len(), 1);
        assert_eq!(
            IdentifierMap::from_pairs([("doc-a", "id-1"), ("doc-a", "id-2")]).unwrap_err(),
            RecordError::DuplicateIdentifier("doc-a".to_string())
        );
    }

    #[test]
    fn test_resolution_targets_owner_final_id() {
        let ids = ids();
        let resolver = ReferenceResolver::new(&ids);
        let op = resolver.patch_operation(&lineage("doc-B", "doc-A")).unwrap();
        assert_eq!(op.owner_final, "id-456");
        assert_eq!(op.directive, EditDirective::Add);
        assert_eq!(op.locator, ".//mrl:LI_Lineage[mrl:source/@uuidref='doc-A']");
        assert_eq!(
            op.payload,
            r#"<mrl:source xmlns:mrl="http://standards.iso.org/iso/19115/-3/mrl/2.0" uuidref="id-123"/>"#
        );
        assert_eq!(op.wrapped_payload(), format!("<gn_add>{}</gn_add>", op.payload));
    }

    #[test]
    fn test_missing_target_is_unresolved() {
        let ids = ids();
        let resolver = ReferenceResolver::new(&ids);
        let err = resolver.patch_operation(&lineage("doc-B", "doc-Z")).unwrap_err();
        assert_eq!(
            err,
            RecordError::UnresolvedReference {
                owner: "doc-B".to_string(),
                target: "doc-Z".to_string()
            }
        );
    }

    #[test]
    fn test_associated_resource_payload_is_sub_element() {
        let ids = ids();
        let resolver = ReferenceResolver::new(&ids);
        let reference = DeferredReference {
            owner: "doc-B".to_string(),
            field: "associatedResource".to_string(),
            raw_target: "doc-A".to_string(),
            association: Some("isComposedOf".to_string()),
        };
        let op = resolver.patch_operation(&reference).unwrap();
        assert_eq!(op.directive, EditDirective::Replace);
        assert!(op.locator.ends_with(
            "mri:associatedResource[mri:MD_AssociatedResource/mri:metadataReference/@uuidref='doc-A']"
        ));
        assert!(op.payload.starts_with("<mri:MD_AssociatedResource "));
        assert!(op.payload.contains(r#"uuidref="id-123""#));
        assert!(op.payload.contains(r#"codeListValue="isComposedOf""#));
    }

    #[test]
    fn test_patch_operations_filter_by_owner() {
        let ids = ids();
        let resolver = ReferenceResolver::new(&ids);
        let refs = vec![lineage("doc-B", "doc-A"), lineage("doc-A", "doc-B")];
        let ops = resolver.patch_operations("doc-B", &refs).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].owner_local, "doc-B");
    }

    #[test]
    fn test_apply_add_patch_appends_source() {
        let ns = NamespaceContext::iso19115_3();
        let mut doc = XmlDocument::parse(OWNER, &ns).unwrap();
        let ids = IdentifierMap::from_pairs([("doc-a", "id-123"), ("doc-b", "id-456")]).unwrap();
        let op = ReferenceResolver::new(&ids)
            .patch_operation(&lineage("doc-b", "doc-a"))
            .unwrap();
        assert_eq!(apply_patch(&mut doc, &op, &ns).unwrap(), 1);
        // The placeholder stays next to the resolved source.
        assert_eq!(values(&doc, "//mrl:source/@uuidref"), vec!["doc-a", "id-123"]);
    }

    #[test]
    fn test_apply_replace_patch_swaps_content() {
        let ns = NamespaceContext::iso19115_3();
        let mut doc = XmlDocument::parse(OWNER, &ns).unwrap();
        let ids = IdentifierMap::from_pairs([("doc-a", "id-123"), ("doc-b", "id-456")]).unwrap();
        let reference = DeferredReference {
            owner: "doc-b".to_string(),
            field: "associatedResource".to_string(),
            raw_target: "doc-a".to_string(),
            association: Some("isComposedOf".to_string()),
        };
        let op = ReferenceResolver::new(&ids).patch_operation(&reference).unwrap();
        apply_patch(&mut doc, &op, &ns).unwrap();
        assert_eq!(
            values(
                &doc,
                "//mri:associatedResource/mri:MD_AssociatedResource/mri:metadataReference/@uuidref"
            ),
            vec!["id-123"]
        );
        // Applying twice fails: the placeholder is gone.
        let err = apply_patch(&mut doc, &op, &ns).unwrap_err();
        assert!(matches!(err, RecordError::Patch { ref owner, .. } if owner == "doc-b"));
    }

    #[test]
    fn test_create_and_delete_directives() {
        let ns = NamespaceContext::iso19115_3();
        let mut doc = XmlDocument::parse(OWNER, &ns).unwrap();
        let payload = r#"<mrl:statement><gco:CharacterString>Scanned</gco:CharacterString></mrl:statement>"#;
        apply_edit(&mut doc, ".//mrl:LI_Lineage", payload, EditDirective::Create, &ns).unwrap();
        apply_edit(&mut doc, ".//mrl:LI_Lineage", payload, EditDirective::Create, &ns).unwrap();
        assert_eq!(values(&doc, "//mrl:statement").len(), 1);

        apply_edit(&mut doc, ".//mrl:statement", "", EditDirective::Delete, &ns).unwrap();
        assert!(values(&doc, "//mrl:statement").is_empty());
    }

    #[test]
    fn test_attribute_and_text_edits() {
        let ns = NamespaceContext::iso19115_3();
        let mut doc = XmlDocument::parse(OWNER, &ns).unwrap();
        apply_edit(
            &mut doc,
            ".//mrl:LI_Lineage/mrl:source[@uuidref='doc-a']/@uuidref",
            "id-9",
            EditDirective::Replace,
            &ns,
        )
        .unwrap();
        assert_eq!(values(&doc, "//mrl:source/@uuidref"), vec!["id-9"]);
        let err = apply_edit(&mut doc, ".//mrl:source/@uuidref", "x", EditDirective::Add, &ns)
            .unwrap_err();
        assert!(matches!(err, RecordError::Patch { .. }));
    }

    #[test]
    fn test_directive_wrapping_and_parsing() {
        assert_eq!(EditDirective::Create.wrap("<a/>"), "<gn_create><a/></gn_create>");
        assert_eq!(EditDirective::Delete.wrap(""), "<gn_delete></gn_delete>");
        assert_eq!("REPLACE".parse::<EditDirective>().unwrap(), EditDirective::Replace);
        assert!("merge".parse::<EditDirective>().is_err());
    }
}
