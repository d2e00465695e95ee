// Composer registry for metadata tree fields
//
// Every field of a metadata tree that produces XML maps to one `ComposerKind`. The mapping is
// closed: each kind statically declares where its fragment attaches, which parameters it
// reads and where they land inside the fragment.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::resolver::EditDirective;

/// Global registry of the built-in composer kinds, keyed by type name.
pub static COMPOSERS: Lazy<ComposerRegistry> = Lazy::new(ComposerRegistry::create);

/// Where a parameter value is written inside a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertionPoint {
    pub locator: &'static str,
    /// Attribute to set on every match. `None` writes the value as element text.
    pub attribute: Option<&'static str>,
}

const fn text(locator: &'static str) -> InsertionPoint {
    InsertionPoint {
        locator,
        attribute: None,
    }
}

const fn attr(locator: &'static str, attribute: &'static str) -> InsertionPoint {
    InsertionPoint {
        locator,
        attribute: Some(attribute),
    }
}

/// Where a parameter value comes from in the metadata subtree handed to a composer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// The subtree itself, which must be a scalar.
    Scalar,
    /// UUID v5 (X.500 namespace) of the scalar subtree.
    DerivedUuid,
    /// A required key of a mapping subtree.
    Field(&'static str),
    /// A key of a mapping subtree that may be absent or null.
    OptionalField(&'static str),
}

impl ValueSource {
    pub fn field(&self) -> Option<&'static str> {
        match *self {
            ValueSource::Field(name) | ValueSource::OptionalField(name) => Some(name),
            ValueSource::Scalar | ValueSource::DerivedUuid => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterSpec {
    pub key: &'static str,
    pub source: ValueSource,
    pub insertion: InsertionPoint,
}

const fn param(key: &'static str, source: ValueSource, insertion: InsertionPoint) -> ParameterSpec {
    ParameterSpec {
        key,
        source,
        insertion,
    }
}

/// Orders a fragment relative to an existing child of the attachment point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingAnchor {
    Before(&'static str),
    After(&'static str),
}

impl SiblingAnchor {
    pub fn locator(&self) -> &'static str {
        match self {
            SiblingAnchor::Before(locator) | SiblingAnchor::After(locator) => locator,
        }
    }
}

/// How a cross-record reference held by a composer is patched once its target is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceSpec {
    /// Parameter holding the referenced record's identifier.
    pub target: &'static str,
    /// Extra parameter needed to re-render the composer (association type).
    pub association: Option<&'static str>,
    /// Path from the record root to the element that holds the reference.
    pub attachment: &'static str,
    /// Path from the attachment element to the attribute carrying the raw target.
    pub discriminator: &'static str,
    /// Sub-element of the rendered fragment sent as payload. `None` sends the whole fragment.
    pub payload: Option<&'static str>,
    pub directive: EditDirective,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposerSpec {
    /// Where the fragment attaches, relative to the base document root.
    pub parent: &'static str,
    pub anchor: Option<SiblingAnchor>,
    /// Leaf composers own their whole subtree; the builder does not descend into it.
    pub leaf: bool,
    pub parameters: Vec<ParameterSpec>,
    pub reference: Option<ReferenceSpec>,
}

const IDENTIFICATION: &str = "./mdb:identificationInfo/mri:MD_DataIdentification";
const CITATION: &str = "./mdb:identificationInfo/mri:MD_DataIdentification/mri:citation/cit:CI_Citation";
const EXTENT: &str = "./mdb:identificationInfo/mri:MD_DataIdentification/mri:extent/gex:EX_Extent";
const PROCESS_STEP: &str = "./mdb:resourceLineage/mrl:LI_Lineage/mrl:processStep/mrl:LE_ProcessStep";

const SOURCE_PARAMETERS: [ParameterSpec; 3] = [
    param(
        "title",
        ValueSource::Field("title"),
        text("//mrl:sourceCitation//cit:title/gco:CharacterString"),
    ),
    param(
        "identifier",
        ValueSource::Field("identifier"),
        text("//mrl:sourceCitation//mcc:MD_Identifier/mcc:code/gco:CharacterString"),
    ),
    param(
        "url",
        ValueSource::Field("url"),
        text("//cit:onlineResource//cit:linkage/gco:CharacterString"),
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComposerKind {
    Identifier,
    Identification,
    Abstract,
    SpatialResolution,
    Scope,
    Events,
    PresentationForm,
    Extent,
    TemporalExtent,
    GeoExtent,
    Keywords,
    AssociatedResource,
    DistributionInfo,
    DistributionFormat,
    OnlineResources,
    Individuals,
    Organisations,
    PartyIdentifier,
    Overview,
    ResourceLineage,
    ProcessStep,
    ProcessStepSource,
    ProcessStepOutput,
}

impl ComposerKind {
    pub const ALL: &'static [ComposerKind] = &[
        ComposerKind::Identifier,
        ComposerKind::Identification,
        ComposerKind::Abstract,
        ComposerKind::SpatialResolution,
        ComposerKind::Scope,
        ComposerKind::Events,
        ComposerKind::PresentationForm,
        ComposerKind::Extent,
        ComposerKind::TemporalExtent,
        ComposerKind::GeoExtent,
        ComposerKind::Keywords,
        ComposerKind::AssociatedResource,
        ComposerKind::DistributionInfo,
        ComposerKind::DistributionFormat,
        ComposerKind::OnlineResources,
        ComposerKind::Individuals,
        ComposerKind::Organisations,
        ComposerKind::PartyIdentifier,
        ComposerKind::Overview,
        ComposerKind::ResourceLineage,
        ComposerKind::ProcessStep,
        ComposerKind::ProcessStepSource,
        ComposerKind::ProcessStepOutput,
    ];

    pub fn type_name(&self) -> &'static str {
        match self {
            ComposerKind::Identifier => "Identifier",
            ComposerKind::Identification => "Identification",
            ComposerKind::Abstract => "Abstract",
            ComposerKind::SpatialResolution => "SpatialResolution",
            ComposerKind::Scope => "Scope",
            ComposerKind::Events => "Events",
            ComposerKind::PresentationForm => "PresentationForm",
            ComposerKind::Extent => "Extent",
            ComposerKind::TemporalExtent => "TemporalExtent",
            ComposerKind::GeoExtent => "GeoExtent",
            ComposerKind::Keywords => "Keywords",
            ComposerKind::AssociatedResource => "AssociatedResource",
            ComposerKind::DistributionInfo => "DistributionInfo",
            ComposerKind::DistributionFormat => "DistributionFormat",
            ComposerKind::OnlineResources => "OnlineResources",
            ComposerKind::Individuals => "Individuals",
            ComposerKind::Organisations => "Organisations",
            ComposerKind::PartyIdentifier => "PartyIdentifier",
            ComposerKind::Overview => "Overview",
            ComposerKind::ResourceLineage => "ResourceLineage",
            ComposerKind::ProcessStep => "ProcessStep",
            ComposerKind::ProcessStepSource => "ProcessStepSource",
            ComposerKind::ProcessStepOutput => "ProcessStepOutput",
        }
    }

    /// Look up the kind for a tree field. The first character is capitalized before an exact
    /// comparison, so `resourceLineage` and `ResourceLineage` both match.
    pub fn from_field(field: &str) -> Option<ComposerKind> {
        COMPOSERS.get(field)
    }

    pub fn is_leaf(&self) -> bool {
        self.spec().leaf
    }

    pub fn is_reference(&self) -> bool {
        self.spec().reference.is_some()
    }

    pub fn spec(&self) -> ComposerSpec {
        use ValueSource::*;
        let leaf = |parent: &'static str, parameters: Vec<ParameterSpec>| ComposerSpec {
            parent,
            anchor: None,
            leaf: true,
            parameters,
            reference: None,
        };
        let branch = |parent: &'static str, parameters: Vec<ParameterSpec>| ComposerSpec {
            leaf: false,
            ..leaf(parent, parameters)
        };

        match self {
            ComposerKind::Identifier => leaf(
                "./mdb:metadataIdentifier",
                vec![param("uuid", DerivedUuid, text("//mcc:code/gco:CharacterString"))],
            ),
            ComposerKind::Identification => leaf(
                CITATION,
                vec![param("title", Field("title"), text("//cit:title/gco:CharacterString"))],
            ),
            ComposerKind::Abstract => leaf(
                IDENTIFICATION,
                vec![param("abstract", Scalar, text("//mri:abstract/gco:CharacterString"))],
            ),
            ComposerKind::SpatialResolution => leaf(
                "./mdb:identificationInfo/mri:MD_DataIdentification/mri:spatialResolution",
                vec![param(
                    "spatial_resolution",
                    Scalar,
                    text("//mri:denominator/gco:Integer"),
                )],
            ),
            ComposerKind::Scope => leaf(
                ".",
                vec![param(
                    "scope",
                    Scalar,
                    attr(
                        "//mdb:metadataScope/mdb:MD_MetadataScope/mdb:resourceScope/mcc:MD_ScopeCode",
                        "codeListValue",
                    ),
                )],
            ),
            ComposerKind::Events => leaf(
                CITATION,
                vec![
                    param("date", Field("value"), text("//cit:date/gco:Date")),
                    param(
                        "event_type",
                        Field("event"),
                        attr("//cit:dateType/cit:CI_DateTypeCode", "codeListValue"),
                    ),
                ],
            ),
            ComposerKind::PresentationForm => leaf(
                CITATION,
                vec![param(
                    "presentation_format",
                    Scalar,
                    attr("//cit:CI_PresentationFormCode", "codeListValue"),
                )],
            ),
            ComposerKind::Extent => branch(IDENTIFICATION, vec![]),
            ComposerKind::TemporalExtent => leaf(
                EXTENT,
                vec![
                    param("begin_position", Field("beginPosition"), text("//gml:beginPosition")),
                    param("end_position", Field("endPosition"), text("//gml:endPosition")),
                ],
            ),
            ComposerKind::GeoExtent => leaf(
                EXTENT,
                vec![
                    param(
                        "westbound_longitude",
                        Field("westBoundLongitude"),
                        text(".//gex:westBoundLongitude/gco:Decimal"),
                    ),
                    param(
                        "eastbound_longitude",
                        Field("eastBoundLongitude"),
                        text(".//gex:eastBoundLongitude/gco:Decimal"),
                    ),
                    param(
                        "southbound_latitude",
                        Field("southBoundLatitude"),
                        text(".//gex:southBoundLatitude/gco:Decimal"),
                    ),
                    param(
                        "northbound_latitude",
                        Field("northBoundLatitude"),
                        text(".//gex:northBoundLatitude/gco:Decimal"),
                    ),
                ],
            ),
            ComposerKind::Keywords => leaf(
                IDENTIFICATION,
                vec![
                    param("keyword", Field("value"), text("//mri:keyword/gco:CharacterString")),
                    param(
                        "keyword_type",
                        Field("typeOfKeyword"),
                        attr("//mri:type/mri:MD_KeywordTypeCode", "codeListValue"),
                    ),
                ],
            ),
            ComposerKind::AssociatedResource => ComposerSpec {
                reference: Some(ReferenceSpec {
                    target: "value",
                    association: Some("typeOfAssociation"),
                    attachment:
                        "./mdb:identificationInfo/mri:MD_DataIdentification/mri:associatedResource",
                    discriminator: "mri:MD_AssociatedResource/mri:metadataReference/@uuidref",
                    payload: Some("./mri:MD_AssociatedResource"),
                    directive: EditDirective::Replace,
                }),
                ..leaf(
                    IDENTIFICATION,
                    vec![
                        param("value", Field("value"), attr("//mri:metadataReference", "uuidref")),
                        param(
                            "typeOfAssociation",
                            Field("typeOfAssociation"),
                            attr(
                                "//mri:associationType/mri:DS_AssociationTypeCode",
                                "codeListValue",
                            ),
                        ),
                    ],
                )
            },
            ComposerKind::DistributionInfo => branch(
                ".",
                vec![
                    param(
                        "distributor",
                        Field("distributor"),
                        text("//cit:CI_Organisation/cit:name/gco:CharacterString"),
                    ),
                    param(
                        "mail",
                        Field("distributor_mail"),
                        text("//cit:electronicMailAddress/gco:CharacterString"),
                    ),
                    param(
                        "distributor_logo",
                        OptionalField("distributor_logo"),
                        text("//cit:logo//mcc:fileName/gco:CharacterString"),
                    ),
                ],
            ),
            ComposerKind::DistributionFormat => leaf(
                "./mdb:distributionInfo/mrd:MD_Distribution/mrd:distributionFormat",
                vec![param(
                    "distribution_format",
                    Scalar,
                    text("//mrd:formatSpecificationCitation/cit:CI_Citation/cit:title/gco:CharacterString"),
                )],
            ),
            ComposerKind::OnlineResources => leaf(
                "./mdb:distributionInfo/mrd:MD_Distribution/mrd:transferOptions/mrd:MD_DigitalTransferOptions",
                vec![
                    param(
                        "linkage",
                        Field("linkage"),
                        text("//cit:CI_OnlineResource/cit:linkage/gco:CharacterString"),
                    ),
                    param(
                        "protocol",
                        Field("protocol"),
                        text("//cit:CI_OnlineResource/cit:protocol/gco:CharacterString"),
                    ),
                    param(
                        "name",
                        Field("name"),
                        text("//cit:CI_OnlineResource/cit:name/gco:CharacterString"),
                    ),
                    param(
                        "type",
                        Field("onlineFunctionCode"),
                        attr(
                            "//cit:CI_OnlineResource/cit:function/cit:CI_OnLineFunctionCode",
                            "codeListValue",
                        ),
                    ),
                    param(
                        "description",
                        OptionalField("description"),
                        text("//cit:CI_OnlineResource/cit:description/gco:CharacterString"),
                    ),
                ],
            ),
            ComposerKind::Individuals => branch(
                IDENTIFICATION,
                vec![
                    param(
                        "name",
                        Field("name"),
                        text("//cit:CI_Individual/cit:name/gco:CharacterString"),
                    ),
                    param(
                        "role",
                        Field("role"),
                        attr("//cit:role/cit:CI_RoleCode", "codeListValue"),
                    ),
                ],
            ),
            ComposerKind::Organisations => branch(
                IDENTIFICATION,
                vec![
                    param(
                        "name",
                        Field("name"),
                        text("//cit:CI_Organisation/cit:name/gco:CharacterString"),
                    ),
                    param(
                        "role",
                        Field("role"),
                        attr("//cit:role/cit:CI_RoleCode", "codeListValue"),
                    ),
                    param(
                        "mail",
                        Field("mail"),
                        text("//cit:electronicMailAddress/gco:CharacterString"),
                    ),
                    param(
                        "logo",
                        OptionalField("logo"),
                        text("//cit:logo//mcc:fileName/gco:CharacterString"),
                    ),
                ],
            ),
            ComposerKind::PartyIdentifier => leaf(
                ".//mri:pointOfContact/cit:CI_Responsibility/cit:party/*",
                vec![
                    param(
                        "authority_name",
                        Field("authority_name"),
                        text("//mcc:authority//cit:title/gco:CharacterString"),
                    ),
                    param("code", Field("code"), text("//mcc:code/gco:CharacterString")),
                    param(
                        "codespace",
                        Field("codespace"),
                        text("//mcc:codeSpace/gco:CharacterString"),
                    ),
                ],
            ),
            ComposerKind::Overview => leaf(
                IDENTIFICATION,
                vec![param("overview", Scalar, text("//mcc:fileName/gco:CharacterString"))],
            ),
            ComposerKind::ResourceLineage => ComposerSpec {
                reference: Some(ReferenceSpec {
                    target: "value",
                    association: None,
                    attachment: ".//mrl:LI_Lineage",
                    discriminator: "mrl:source/@uuidref",
                    payload: None,
                    directive: EditDirective::Add,
                }),
                ..leaf(
                    ".//mrl:LI_Lineage",
                    vec![param("value", Scalar, attr("//mrl:source", "uuidref"))],
                )
            },
            ComposerKind::ProcessStep => branch(
                "./mdb:resourceLineage/mrl:LI_Lineage",
                vec![
                    param(
                        "description",
                        Field("description"),
                        text("//mrl:LE_ProcessStep/mrl:description/gco:CharacterString"),
                    ),
                    param(
                        "title",
                        Field("title"),
                        text("//mrl:LE_ProcessStep/mrl:reference//cit:title/gco:CharacterString"),
                    ),
                    param(
                        "processingIdentifier",
                        Field("processingIdentifier"),
                        text("//mrl:LE_ProcessStep/mrl:reference//cit:identifier//mcc:code/gco:CharacterString"),
                    ),
                    param(
                        "typeOfActivity",
                        Field("typeOfActivity"),
                        text("//mrl:LE_Processing/mrl:identifier/mcc:MD_Identifier/mcc:code/gco:CharacterString"),
                    ),
                    param(
                        "softwareTitle",
                        Field("softwareTitle"),
                        text("//mrl:softwareReference//cit:title/gco:CharacterString"),
                    ),
                    param(
                        "softwareIdentifier",
                        Field("softwareIdentifier"),
                        text("//mrl:softwareReference//mcc:MD_Identifier/mcc:code/gco:CharacterString"),
                    ),
                ],
            ),
            ComposerKind::ProcessStepSource => ComposerSpec {
                anchor: Some(SiblingAnchor::Before("./mrl:processingInformation")),
                ..leaf(PROCESS_STEP, PROCESS_STEP_SOURCE.to_vec())
            },
            ComposerKind::ProcessStepOutput => ComposerSpec {
                anchor: Some(SiblingAnchor::After("./mrl:processingInformation")),
                ..leaf(PROCESS_STEP, PROCESS_STEP_OUTPUT.to_vec())
            },
        }
    }

    /// Keys of a mapping subtree consumed as parameters by this kind.
    pub fn consumed_fields(&self) -> impl Iterator<Item = &'static str> {
        self.spec()
            .parameters
            .into_iter()
            .filter_map(|p| p.source.field())
    }
}

const PROCESS_STEP_SOURCE: [ParameterSpec; 4] = [
    param(
        "description",
        ValueSource::Field("description"),
        text("//mrl:LI_Source/mrl:description/gco:CharacterString"),
    ),
    SOURCE_PARAMETERS[0],
    SOURCE_PARAMETERS[1],
    SOURCE_PARAMETERS[2],
];

const PROCESS_STEP_OUTPUT: [ParameterSpec; 4] = [
    param(
        "description",
        ValueSource::Field("description"),
        text("//mrl:LE_Source/mrl:description/gco:CharacterString"),
    ),
    SOURCE_PARAMETERS[0],
    SOURCE_PARAMETERS[1],
    SOURCE_PARAMETERS[2],
];

/// Lookup table from type name to composer kind.
#[derive(Debug, Clone)]
pub struct ComposerRegistry(HashMap<&'static str, ComposerKind>);

impl ComposerRegistry {
    /// Create the registry holding every built-in kind
    pub fn create() -> Self {
        ComposerRegistry(
            ComposerKind::ALL
                .iter()
                .map(|kind| (kind.type_name(), *kind))
                .collect(),
        )
    }

    /// Resolve a tree field name to its composer kind
    pub fn get(&self, field: &str) -> Option<ComposerKind> {
        let mut chars = field.chars();
        let first = chars.next()?;
        let type_name: String = first.to_uppercase().chain(chars).collect();
        self.0.get(type_name.as_str()).copied()
    }

    /// List all registered type names
    pub fn list_kinds(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.0.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_lookup_capitalizes_first_character() {
        assert_eq!(
            ComposerKind::from_field("resourceLineage"),
            Some(ComposerKind::ResourceLineage)
        );
        assert_eq!(
            ComposerKind::from_field("ResourceLineage"),
            Some(ComposerKind::ResourceLineage)
        );
        assert_eq!(ComposerKind::from_field("identifier"), Some(ComposerKind::Identifier));
        // Matching is exact after the first character.
        assert_eq!(ComposerKind::from_field("resourcelineage"), None);
        assert_eq!(ComposerKind::from_field("title"), None);
        assert_eq!(ComposerKind::from_field(""), None);
    }

    #[test]
    fn test_registry_lists_every_kind() {
        assert_eq!(COMPOSERS.list_kinds().len(), ComposerKind::ALL.len());
    }

    #[test]
    fn test_leaf_and_reference_flags() {
        let branches: Vec<_> = ComposerKind::ALL.iter().filter(|k| !k.is_leaf()).collect();
        assert_eq!(
            branches,
            vec![
                &ComposerKind::Extent,
                &ComposerKind::DistributionInfo,
                &ComposerKind::Individuals,
                &ComposerKind::Organisations,
                &ComposerKind::ProcessStep,
            ]
        );
        let references: Vec<_> = ComposerKind::ALL.iter().filter(|k| k.is_reference()).collect();
        assert_eq!(
            references,
            vec![&ComposerKind::AssociatedResource, &ComposerKind::ResourceLineage]
        );
    }

    #[test]
    fn test_anchors() {
        assert_eq!(
            ComposerKind::ProcessStepSource.spec().anchor,
            Some(SiblingAnchor::Before("./mrl:processingInformation"))
        );
        assert_eq!(
            ComposerKind::ProcessStepOutput.spec().anchor,
            Some(SiblingAnchor::After("./mrl:processingInformation"))
        );
    }
}
