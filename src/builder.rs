use serde_yaml::Value;
use std::collections::VecDeque;

use crate::{
    composer::{templates, Composer, ComposerKind, SiblingAnchor},
    error::RecordError,
    resolver::DeferredReference,
    tree::MetadataTree,
    xml::{Locator, NamespaceContext, NodeId, XmlDocument},
};

/// Non-fatal findings collected while turning a metadata tree into composers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildDiagnostic {
    /// A tree field with no composer. Its children are still visited.
    UnknownField { owner: String, field: String },
}

impl BuildDiagnostic {
    pub fn unknown_field(owner: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            owner: owner.into(),
            field: field.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderState {
    Open,
    Built,
}

/// The output of [`RecordBuilder::build`].
#[derive(Debug, Clone)]
pub struct BuiltRecord {
    local_id: String,
    document: XmlDocument,
    deferred: Vec<DeferredReference>,
    diagnostics: Vec<BuildDiagnostic>,
}

impl BuiltRecord {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn document(&self) -> &XmlDocument {
        &self.document
    }

    pub fn into_document(self) -> XmlDocument {
        self.document
    }

    /// References left for the second phase, in traversal order.
    pub fn deferred(&self) -> &[DeferredReference] {
        &self.deferred
    }

    pub fn diagnostics(&self) -> &[BuildDiagnostic] {
        &self.diagnostics
    }

    pub fn to_xml_string(&self, ns: &NamespaceContext) -> Result<String, RecordError> {
        self.document.to_xml_string(ns)
    }
}

/// RecordBuilder turns one metadata tree into one ISO 19115-3 record.
///
/// It starts from a fresh copy of the base document. [`RecordBuilder::process_tree`] walks the
/// tree and registers one [`Composer`] per recognised field; [`RecordBuilder::build`] renders
/// every composer and splices its fragment at each attachment point of the base document.
///
/// A builder is single use: `build` consumes the composer list and a second call fails.
/// Reference fields whose target is not yet a final identifier are collected as
/// [`DeferredReference`]s and handed out with the built record.
#[derive(Debug)]
pub struct RecordBuilder {
    ns: NamespaceContext,
    base: XmlDocument,
    local_id: Option<String>,
    composers: Vec<Composer>,
    deferred: Vec<DeferredReference>,
    diagnostics: Vec<BuildDiagnostic>,
    state: BuilderState,
}

impl RecordBuilder {
    pub fn new() -> Result<Self, RecordError> {
        RecordBuilder::with_namespaces(NamespaceContext::default())
    }

    pub fn with_namespaces(ns: NamespaceContext) -> Result<Self, RecordError> {
        let base = XmlDocument::parse(templates::base_document()?, &ns)?;
        Ok(RecordBuilder::from_base(base, ns))
    }

    /// Start from an already parsed base document.
    pub fn from_base(base: XmlDocument, ns: NamespaceContext) -> Self {
        RecordBuilder {
            ns,
            base,
            local_id: None,
            composers: Vec::new(),
            deferred: Vec::new(),
            diagnostics: Vec::new(),
            state: BuilderState::Open,
        }
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    pub fn namespaces(&self) -> &NamespaceContext {
        &self.ns
    }

    pub fn composers(&self) -> &[Composer] {
        &self.composers
    }

    pub fn deferred(&self) -> &[DeferredReference] {
        &self.deferred
    }

    pub fn diagnostics(&self) -> &[BuildDiagnostic] {
        &self.diagnostics
    }

    fn ensure_open(&self) -> Result<(), RecordError> {
        match self.state {
            BuilderState::Open => Ok(()),
            BuilderState::Built => Err(RecordError::Usage(
                "the record builder has already been used".to_string(),
            )),
        }
    }

    pub fn set_local_id(&mut self, local_id: impl Into<String>) -> Result<&mut Self, RecordError> {
        self.ensure_open()?;
        let local_id = local_id.into();
        match &self.local_id {
            Some(existing) if *existing != local_id => {
                return Err(RecordError::Usage(format!(
                    "builder for '{existing}' cannot take a tree identified as '{local_id}'"
                )))
            }
            _ => self.local_id = Some(local_id),
        }
        Ok(self)
    }

    /// Register the composers for every recognised field of `tree`.
    ///
    /// The walk is depth first and keeps field order. Sequences expand into one entry per item
    /// under the same field name. Leaf composers own their subtree; for other fields the
    /// mapping children are visited next, except the keys a composer consumed as parameters.
    pub fn process_tree(&mut self, tree: &MetadataTree) -> Result<&mut Self, RecordError> {
        self.set_local_id(tree.local_id())?;

        let mut stack: VecDeque<(String, &Value)> = tree
            .fields()
            .map(|(field, value)| (field.to_string(), value))
            .collect();

        while let Some((field, subtree)) = stack.pop_front() {
            if let Value::Sequence(items) = subtree {
                for item in items.iter().rev() {
                    stack.push_front((field.clone(), item));
                }
                continue;
            }

            let mut consumed: Vec<&'static str> = Vec::new();
            match ComposerKind::from_field(&field) {
                Some(kind) => {
                    let composer = Composer::new(kind, subtree)?;
                    self.register(&field, composer)?;
                    if kind.is_leaf() {
                        continue;
                    }
                    consumed.extend(kind.consumed_fields());
                }
                None => {
                    tracing::warn!(
                        "No composer found for field '{}' of '{}'. Composition continues, \
                         but the record may be incomplete",
                        field,
                        tree.local_id()
                    );
                    self.diagnostics
                        .push(BuildDiagnostic::unknown_field(tree.local_id(), &field));
                }
            }

            if let Value::Mapping(children) = subtree {
                let children: Vec<(String, &Value)> = children
                    .iter()
                    .filter_map(|(key, value)| key.as_str().map(|key| (key.to_string(), value)))
                    .filter(|(key, _)| !consumed.contains(&key.as_str()))
                    .collect();
                for child in children.into_iter().rev() {
                    stack.push_front(child);
                }
            }
        }
        tracing::debug!(
            "[RecordBuilder::process_tree] '{}': {} composer(s), {} deferred reference(s)",
            tree.local_id(),
            self.composers.len(),
            self.deferred.len()
        );
        Ok(self)
    }

    /// Append a composer to the build chain.
    pub fn add_composer(&mut self, composer: Composer) -> Result<&mut Self, RecordError> {
        let kind = composer.kind();
        let type_name = kind.type_name();
        let mut chars = type_name.chars();
        let field: String = match chars.next() {
            Some(first) => first.to_lowercase().chain(chars).collect(),
            None => String::new(),
        };
        self.register(&field, composer)?;
        Ok(self)
    }

    fn register(&mut self, field: &str, composer: Composer) -> Result<(), RecordError> {
        self.ensure_open()?;
        if let Some(target) = composer.deferred_target() {
            let owner = self.local_id.clone().ok_or_else(|| {
                RecordError::Usage(
                    "a record identifier is required before adding references".to_string(),
                )
            })?;
            self.deferred.push(DeferredReference {
                owner,
                field: field.to_string(),
                raw_target: target.to_string(),
                association: composer.association().map(str::to_string),
            });
        }
        self.composers.push(composer);
        Ok(())
    }

    /// Render every registered composer and splice the fragments into the base document.
    ///
    /// A parent locator may match several attachment points; the fragment is copied to each.
    pub fn build(&mut self) -> Result<BuiltRecord, RecordError> {
        self.ensure_open()?;
        self.state = BuilderState::Built;
        let local_id = self.local_id.clone().ok_or_else(|| {
            RecordError::Usage("no metadata tree was processed by this builder".to_string())
        })?;
        let root = self
            .base
            .root()
            .ok_or_else(|| RecordError::Xml("base document has no root element".to_string()))?;

        for composer in std::mem::take(&mut self.composers) {
            self.splice(root, &composer)?;
        }

        tracing::info!(
            "Built record '{}' ({} deferred reference(s), {} diagnostic(s))",
            local_id,
            self.deferred.len(),
            self.diagnostics.len()
        );
        Ok(BuiltRecord {
            local_id,
            document: std::mem::take(&mut self.base),
            deferred: std::mem::take(&mut self.deferred),
            diagnostics: std::mem::take(&mut self.diagnostics),
        })
    }

    fn splice(&mut self, root: NodeId, composer: &Composer) -> Result<(), RecordError> {
        let kind = composer.kind();
        let spec = kind.spec();
        let attachment_err = |locator: &str| RecordError::Attachment {
            composer: kind.type_name().to_string(),
            locator: locator.to_string(),
        };

        let fragment = composer.render(&self.ns)?;
        let fragment_root = fragment
            .root()
            .ok_or_else(|| RecordError::Xml(format!("empty {} fragment", kind.type_name())))?;
        let points = Locator::parse(spec.parent, &self.ns)?.select(&self.base, root);
        if points.is_empty() {
            return Err(attachment_err(spec.parent));
        }
        let anchor = spec
            .anchor
            .map(|anchor| Locator::parse(anchor.locator(), &self.ns).map(|l| (anchor, l)))
            .transpose()?;

        for point in &points {
            let index = match &anchor {
                None => self.base.children(*point).len(),
                Some((kind_of_anchor, locator)) => {
                    let sibling = locator
                        .select(&self.base, *point)
                        .first()
                        .copied()
                        .ok_or_else(|| attachment_err(locator.as_str()))?;
                    let index = self
                        .base
                        .index_of(*point, sibling)
                        .ok_or_else(|| attachment_err(locator.as_str()))?;
                    match kind_of_anchor {
                        SiblingAnchor::Before(_) => index,
                        SiblingAnchor::After(_) => index + 1,
                    }
                }
            };
            let copy = self.base.import(&fragment, fragment_root)?;
            self.base.insert_child(*point, index, copy)?;
        }
        tracing::debug!(
            "[RecordBuilder::build] spliced {} at {} point(s) of '{}'",
            kind.type_name(),
            points.len(),
            spec.parent
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::DOCUMENT_NODE;

    fn tree(text: &str) -> MetadataTree {
        MetadataTree::from_yaml_str(text).unwrap()
    }

    fn build(text: &str) -> BuiltRecord {
        let mut builder = RecordBuilder::new().unwrap();
        builder.process_tree(&tree(text)).unwrap();
        builder.build().unwrap()
    }

    fn values(record: &BuiltRecord, expr: &str) -> Vec<String> {
        Locator::parse(expr, &NamespaceContext::iso19115_3())
            .unwrap()
            .values(record.document(), DOCUMENT_NODE)
    }

    fn names(doc: &XmlDocument, parent: NodeId) -> Vec<String> {
        doc.element_children(parent)
            .into_iter()
            .map(|c| doc.name(c).unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_scalar_fields_render_once_under_their_parent() {
        let record = build("identifier: doc-a\nabstract: Atlas of Paris\nscope: dataset\n");
        assert_eq!(
            values(
                &record,
                "/mdb:MD_Metadata/mdb:identificationInfo/mri:MD_DataIdentification/mri:abstract/gco:CharacterString"
            ),
            vec!["Atlas of Paris"]
        );
        assert_eq!(
            values(&record, "/mdb:MD_Metadata/mdb:metadataScope//mcc:MD_ScopeCode/@codeListValue"),
            vec!["dataset"]
        );
        let expected = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_X500, b"doc-a").to_string();
        assert_eq!(
            values(&record, "/mdb:MD_Metadata/mdb:metadataIdentifier//mcc:code/gco:CharacterString"),
            vec![expected]
        );
        assert!(record.diagnostics().is_empty());
    }

    #[test]
    fn test_literal_values_round_trip() {
        let ns = NamespaceContext::iso19115_3();
        for literal in [
            "Paris & banlieue <1789> \"plan\" 'Verniquet'",
            "   ",
            "\t",
            " padded ",
        ] {
            let mut builder = RecordBuilder::new().unwrap();
            builder
                .set_local_id("doc-a")
                .unwrap()
                .add_composer(Composer::new(ComposerKind::Abstract, &Value::from(literal)).unwrap())
                .unwrap();
            let xml = builder.build().unwrap().to_xml_string(&ns).unwrap();
            let reparsed = XmlDocument::parse(&xml, &ns).unwrap();
            let found = Locator::parse("//mri:abstract/gco:CharacterString", &ns)
                .unwrap()
                .values(&reparsed, DOCUMENT_NODE);
            assert_eq!(found, vec![literal], "{literal:?}");
        }
    }

    #[test]
    fn test_second_build_fails() {
        let mut builder = RecordBuilder::new().unwrap();
        builder.process_tree(&tree("identifier: doc-a\n")).unwrap();
        builder.build().unwrap();
        assert_eq!(builder.state(), BuilderState::Built);
        assert!(matches!(builder.build(), Err(RecordError::Usage(_))));
        assert!(matches!(
            builder.process_tree(&tree("identifier: doc-a\n")),
            Err(RecordError::Usage(_))
        ));
    }

    #[test]
    fn test_deferred_references() {
        let record = build(
            "identifier: doc-b\nresourceLineage:\n  - doc-a\n  - e34f34cb-240a-469b-95f5-97075490505b\n",
        );
        assert_eq!(
            record.deferred(),
            &[DeferredReference {
                owner: "doc-b".to_string(),
                field: "resourceLineage".to_string(),
                raw_target: "doc-a".to_string(),
                association: None,
            }]
        );
        // Both sources are written; the local one is a placeholder until patched.
        assert_eq!(
            values(&record, "//mrl:LI_Lineage/mrl:source/@uuidref"),
            vec!["doc-a", "e34f34cb-240a-469b-95f5-97075490505b"]
        );

        let none = build("identifier: doc-b\nresourceLineage: e34f34cb-240a-469b-95f5-97075490505b\n");
        assert!(none.deferred().is_empty());
    }

    #[test]
    fn test_associated_resource_keeps_association_type() {
        let record = build(
            "identifier: doc-b\nassociatedResource:\n  value: doc-a\n  typeOfAssociation: isComposedOf\n",
        );
        assert_eq!(record.deferred().len(), 1);
        assert_eq!(record.deferred()[0].association.as_deref(), Some("isComposedOf"));
    }

    #[test]
    fn test_sequences_expand_in_order() {
        let mut builder = RecordBuilder::new().unwrap();
        builder
            .process_tree(&tree(
                "identifier: doc-a\nkeywords:\n  - {value: Paris, typeOfKeyword: place}\n  - {value: cadastre, typeOfKeyword: theme}\n  - {value: '1789', typeOfKeyword: temporal}\n",
            ))
            .unwrap();
        let keywords: Vec<&str> = builder
            .composers()
            .iter()
            .filter(|c| c.kind() == ComposerKind::Keywords)
            .filter_map(|c| c.parameter("keyword"))
            .collect();
        assert_eq!(keywords, vec!["Paris", "cadastre", "1789"]);
        let record = builder.build().unwrap();
        assert_eq!(
            values(&record, "//mri:keyword/gco:CharacterString"),
            vec!["Paris", "cadastre", "1789"]
        );
    }

    #[test]
    fn test_non_leaf_children_are_composed() {
        let record = build(
            r#"
identifier: doc-a
extent:
  temporalExtent: {beginPosition: '1785', endPosition: '1791'}
  geoExtent:
    westBoundLongitude: 2.2241
    eastBoundLongitude: 2.4699
    southBoundLatitude: 48.8156
    northBoundLatitude: 48.9022
"#,
        );
        assert_eq!(
            values(&record, "//mri:extent/gex:EX_Extent/gex:temporalElement//gml:beginPosition"),
            vec!["1785"]
        );
        assert_eq!(
            values(&record, "//mri:extent/gex:EX_Extent/gex:geographicElement//gex:northBoundLatitude/gco:Decimal"),
            vec!["48.9022"]
        );
        assert!(record.diagnostics().is_empty());
    }

    #[test]
    fn test_consumed_parameters_are_not_revisited() {
        let record = build(
            r#"
identifier: doc-a
distributionInfo:
  distributor: SoDUCo
  distributor_mail: contact@example.org
  distributionFormat: GeoTIFF
  onlineResources:
    - {linkage: 'https://example.org/wms', protocol: 'OGC:WMS', name: verniquet, onlineFunctionCode: browsing}
"#,
        );
        assert!(record.diagnostics().is_empty(), "{:?}", record.diagnostics());
        assert_eq!(
            values(&record, "//mrd:distributionFormat//cit:title/gco:CharacterString"),
            vec!["GeoTIFF"]
        );
        assert_eq!(
            values(&record, "//mrd:MD_DigitalTransferOptions/mrd:onLine//cit:protocol/gco:CharacterString"),
            vec!["OGC:WMS"]
        );
    }

    #[test]
    fn test_unknown_field_warns_and_descends() {
        let record = build("identifier: doc-a\nnotes:\n  abstract: nested abstract\n");
        assert_eq!(
            record.diagnostics(),
            &[BuildDiagnostic::unknown_field("doc-a", "notes")]
        );
        assert_eq!(
            values(&record, "//mri:abstract/gco:CharacterString"),
            vec!["nested abstract"]
        );
    }

    #[test]
    fn test_multiple_attachment_points_duplicate_the_fragment() {
        let record = build(
            r#"
identifier: doc-a
individuals:
  name: Edme Verniquet
  role: author
organisations:
  name: SoDUCo
  role: publisher
  mail: contact@example.org
  partyIdentifier:
    authority_name: ROR
    code: 03x0d0d08
    codespace: ror.org
"#,
        );
        // Both parties exist when the identifier is spliced.
        assert_eq!(
            values(&record, "//cit:party/*/cit:partyIdentifier//mcc:code/gco:CharacterString"),
            vec!["03x0d0d08", "03x0d0d08"]
        );
    }

    #[test]
    fn test_sibling_anchors_order_process_step() {
        let record = build(
            r#"
identifier: doc-a
processStep:
  description: Vectorisation
  title: Verniquet vectorisation
  processingIdentifier: vect-1
  typeOfActivity: vectorisation
  softwareTitle: QGIS
  softwareIdentifier: qgis-3
  processStepOutput:
    {description: Vector layer, title: Streets, identifier: streets, url: 'https://example.org/streets'}
  processStepSource:
    {description: Scanned sheets, title: Atlas, identifier: atlas, url: 'https://example.org/atlas'}
"#,
        );
        let ns = NamespaceContext::iso19115_3();
        let step = Locator::parse("//mrl:LE_ProcessStep", &ns)
            .unwrap()
            .select(record.document(), DOCUMENT_NODE)[0];
        assert_eq!(
            names(record.document(), step),
            vec![
                "mrl:description",
                "mrl:reference",
                "mrl:source",
                "mrl:processingInformation",
                "mrl:output"
            ]
        );
    }

    #[test]
    fn test_missing_attachment_point_is_fatal() {
        let mut builder = RecordBuilder::new().unwrap();
        builder
            .process_tree(&tree(
                "identifier: doc-a\ntemporalExtent: {beginPosition: '1785', endPosition: '1791'}\n",
            ))
            .unwrap();
        let err = builder.build().unwrap_err();
        assert!(matches!(err, RecordError::Attachment { ref composer, .. } if composer == "TemporalExtent"));
    }

    #[test]
    fn test_missing_anchor_is_fatal() {
        let ns = NamespaceContext::iso19115_3();
        let base = XmlDocument::parse(
            "<mdb:MD_Metadata><mdb:resourceLineage><mrl:LI_Lineage><mrl:processStep><mrl:LE_ProcessStep/></mrl:processStep></mrl:LI_Lineage></mdb:resourceLineage></mdb:MD_Metadata>",
            &ns,
        )
        .unwrap();
        let mut builder = RecordBuilder::from_base(base, ns);
        let source = Composer::new(
            ComposerKind::ProcessStepSource,
            &serde_yaml::from_str("{description: d, title: t, identifier: i, url: u}").unwrap(),
        )
        .unwrap();
        builder.set_local_id("doc-a").unwrap().add_composer(source).unwrap();
        let err = builder.build().unwrap_err();
        assert_eq!(
            err,
            RecordError::Attachment {
                composer: "ProcessStepSource".to_string(),
                locator: "./mrl:processingInformation".to_string()
            }
        );
    }

    #[test]
    fn test_missing_field_aborts_the_tree() {
        let mut builder = RecordBuilder::new().unwrap();
        let err = builder
            .process_tree(&tree("identifier: doc-a\nevents: {value: '1791-01-01'}\n"))
            .unwrap_err();
        assert_eq!(err, RecordError::missing_field("Events", "event"));
    }
}
