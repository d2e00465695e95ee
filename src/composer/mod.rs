//! Fragment composers.
//!
//! A [`Composer`] turns one metadata subtree into one XML fragment. Its [`ComposerKind`]
//! says which template to fill, where each parameter lands in it, and where the fragment is
//! spliced in the base document (see [`registry`]).

pub mod registry;
pub mod templates;

pub use registry::{
    ComposerKind, ComposerRegistry, ComposerSpec, InsertionPoint, ParameterSpec, ReferenceSpec,
    SiblingAnchor, ValueSource, COMPOSERS,
};

use serde_yaml::{Mapping, Value};
use uuid::Uuid;

use crate::{
    error::RecordError,
    resolver::is_final_identifier,
    tree::scalar_to_string,
    xml::{Locator, NamespaceContext, XmlDocument},
};

/// One composer instance: a kind plus its resolved parameter values, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composer {
    kind: ComposerKind,
    parameters: Vec<(&'static str, String)>,
}

impl Composer {
    /// Validate `subtree` against the kind's parameter declarations and capture the values.
    pub fn new(kind: ComposerKind, subtree: &Value) -> Result<Self, RecordError> {
        let spec = kind.spec();
        let missing = |field: &str| RecordError::missing_field(kind.type_name(), field);
        let mut parameters = Vec::with_capacity(spec.parameters.len());

        for parameter in spec.parameters.iter() {
            let value = match parameter.source {
                ValueSource::Scalar => {
                    Some(scalar_to_string(subtree).ok_or_else(|| missing(parameter.key))?)
                }
                ValueSource::DerivedUuid => {
                    let local = scalar_to_string(subtree).ok_or_else(|| missing(parameter.key))?;
                    Some(Uuid::new_v5(&Uuid::NAMESPACE_X500, local.as_bytes()).to_string())
                }
                ValueSource::Field(field) => Some(
                    mapping_field(subtree, field)
                        .and_then(scalar_to_string)
                        .ok_or_else(|| missing(field))?,
                ),
                ValueSource::OptionalField(field) => match mapping_field(subtree, field) {
                    None | Some(Value::Null) => None,
                    Some(value) => Some(scalar_to_string(value).ok_or_else(|| missing(field))?),
                },
            };
            if let Some(value) = value {
                parameters.push((parameter.key, value));
            }
        }
        Ok(Composer { kind, parameters })
    }

    /// Re-create a reference composer around an explicit target, as needed to build patch
    /// payloads once the target's final identifier is known.
    pub fn for_reference(
        kind: ComposerKind,
        target: &str,
        association: Option<&str>,
    ) -> Result<Self, RecordError> {
        let spec = kind.spec();
        let reference = spec.reference.ok_or_else(|| {
            RecordError::Usage(format!("{} does not hold references", kind.type_name()))
        })?;
        let target_source = spec
            .parameters
            .iter()
            .find(|p| p.key == reference.target)
            .map(|p| p.source)
            .ok_or_else(|| RecordError::missing_field(kind.type_name(), reference.target))?;

        let subtree = match target_source.field() {
            None => Value::String(target.to_string()),
            Some(field) => {
                let mut mapping = Mapping::new();
                mapping.insert(field.into(), target.into());
                if let Some(key) = reference.association {
                    let field = spec
                        .parameters
                        .iter()
                        .find(|p| p.key == key)
                        .and_then(|p| p.source.field())
                        .unwrap_or(key);
                    if let Some(association) = association {
                        mapping.insert(field.into(), association.into());
                    }
                }
                Value::Mapping(mapping)
            }
        };
        Composer::new(kind, &subtree)
    }

    pub fn kind(&self) -> ComposerKind {
        self.kind
    }

    pub fn parameters(&self) -> &[(&'static str, String)] {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The raw target of a reference composer whose target is not yet a final identifier.
    pub fn deferred_target(&self) -> Option<&str> {
        let reference = self.kind.spec().reference?;
        self.parameter(reference.target)
            .filter(|target| !is_final_identifier(target))
    }

    /// The extra parameter a reference composer needs to be re-rendered.
    pub fn association(&self) -> Option<&str> {
        self.kind
            .spec()
            .reference
            .and_then(|r| r.association)
            .and_then(|key| self.parameter(key))
    }

    /// Render the fragment: a fresh copy of the kind's template with every parameter written
    /// at each match of its insertion point.
    pub fn render(&self, ns: &NamespaceContext) -> Result<XmlDocument, RecordError> {
        self.render_template(templates::fragment(self.kind)?, ns)
    }

    pub(crate) fn render_template(
        &self,
        template: &str,
        ns: &NamespaceContext,
    ) -> Result<XmlDocument, RecordError> {
        let mut doc = XmlDocument::parse(template, ns)?;
        let root = doc.root().ok_or_else(|| {
            RecordError::Xml(format!("{} template has no root element", self.kind.type_name()))
        })?;
        let spec = self.kind.spec();

        for (key, value) in &self.parameters {
            let point = spec
                .parameters
                .iter()
                .find(|p| p.key == *key)
                .map(|p| p.insertion)
                .ok_or_else(|| RecordError::missing_field(self.kind.type_name(), *key))?;
            let locator = Locator::parse(point.locator, ns)?;
            let matches = locator.select(&doc, root);
            if matches.is_empty() {
                return Err(RecordError::TemplateMismatch {
                    composer: self.kind.type_name().to_string(),
                    key: key.to_string(),
                    locator: point.locator.to_string(),
                });
            }
            for node in matches {
                match point.attribute {
                    Some(attribute) => doc.set_attribute(node, attribute, value.as_str())?,
                    None => doc.set_text(node, value.as_str())?,
                }
            }
        }
        tracing::debug!(
            "[Composer::render] {} rendered with {} parameter(s)",
            self.kind.type_name(),
            self.parameters.len()
        );
        Ok(doc)
    }
}

fn mapping_field<'a>(subtree: &'a Value, field: &str) -> Option<&'a Value> {
    match subtree {
        Value::Mapping(mapping) => mapping.get(field),
        _ => None,
    }
}
