//! Fragment templates embedded at compile time.
//!
//! `templates/dataset_iso19115.xml` is the base document every record starts from;
//! `templates/partials/<kind>.xml` holds one fragment per composer kind, named after the kind
//! in lowercase. Fragments carry no namespace declarations of their own: they are parsed
//! against the builder's [`NamespaceContext`](crate::xml::NamespaceContext).

use include_dir::{include_dir, Dir};

use crate::{composer::registry::ComposerKind, error::RecordError};

static TEMPLATES: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/templates");

pub const BASE_DOCUMENT: &str = "dataset_iso19115.xml";

fn template_text(path: &str) -> Result<&'static str, RecordError> {
    TEMPLATES
        .get_file(path)
        .ok_or_else(|| RecordError::NotFound(format!("embedded template '{path}'")))?
        .contents_utf8()
        .ok_or_else(|| RecordError::Xml(format!("embedded template '{path}' is not UTF-8")))
}

pub fn base_document() -> Result<&'static str, RecordError> {
    template_text(BASE_DOCUMENT)
}

pub fn fragment_path(kind: ComposerKind) -> String {
    format!("partials/{}.xml", kind.type_name().to_lowercase())
}

pub fn fragment(kind: ComposerKind) -> Result<&'static str, RecordError> {
    template_text(&fragment_path(kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::{NamespaceContext, XmlDocument};

    #[test]
    fn test_every_kind_has_a_parseable_fragment() {
        let ns = NamespaceContext::iso19115_3();
        for kind in ComposerKind::ALL {
            let text = fragment(*kind).unwrap_or_else(|e| panic!("{kind:?}: {e}"));
            XmlDocument::parse(text, &ns).unwrap_or_else(|e| panic!("{kind:?}: {e}"));
        }
    }

    #[test]
    fn test_base_document_parses() {
        let ns = NamespaceContext::iso19115_3();
        let doc = XmlDocument::parse(base_document().unwrap(), &ns).unwrap();
        assert_eq!(doc.name(doc.root().unwrap()), Some("mdb:MD_Metadata"));
    }
}
