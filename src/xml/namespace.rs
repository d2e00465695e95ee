//! Namespace bindings used when rendering and serializing ISO 19115-3 records.
//!
//! Templates and locators use qualified names (`mri:keyword`) with canonical prefixes. A
//! [`NamespaceContext`] owns the prefix → URI table; it is created per builder and handed to
//! every parse, render and serialize call instead of living in global state.

use std::collections::BTreeMap;

use crate::error::RecordError;

/// Canonical ISO 19115-3 prefixes, as expected by GeoNetwork.
pub const ISO19115_3_NAMESPACES: &[(&str, &str)] = &[
    ("mdb", "http://standards.iso.org/iso/19115/-3/mdb/2.0"),
    ("cat", "http://standards.iso.org/iso/19115/-3/cat/1.0"),
    ("gfc", "http://standards.iso.org/iso/19110/gfc/1.1"),
    ("cit", "http://standards.iso.org/iso/19115/-3/cit/2.0"),
    ("gcx", "http://standards.iso.org/iso/19115/-3/gcx/1.0"),
    ("gex", "http://standards.iso.org/iso/19115/-3/gex/1.0"),
    ("lan", "http://standards.iso.org/iso/19115/-3/lan/1.0"),
    ("srv", "http://standards.iso.org/iso/19115/-3/srv/2.1"),
    ("mas", "http://standards.iso.org/iso/19115/-3/mas/1.0"),
    ("mcc", "http://standards.iso.org/iso/19115/-3/mcc/1.0"),
    ("mco", "http://standards.iso.org/iso/19115/-3/mco/1.0"),
    ("mda", "http://standards.iso.org/iso/19115/-3/mda/1.0"),
    ("mds", "http://standards.iso.org/iso/19115/-3/mds/2.0"),
    ("mdt", "http://standards.iso.org/iso/19115/-3/mdt/2.0"),
    ("mex", "http://standards.iso.org/iso/19115/-3/mex/1.0"),
    ("mmi", "http://standards.iso.org/iso/19115/-3/mmi/1.0"),
    ("mpc", "http://standards.iso.org/iso/19115/-3/mpc/1.0"),
    ("mrc", "http://standards.iso.org/iso/19115/-3/mrc/2.0"),
    ("mrd", "http://standards.iso.org/iso/19115/-3/mrd/1.0"),
    ("mri", "http://standards.iso.org/iso/19115/-3/mri/1.0"),
    ("mrl", "http://standards.iso.org/iso/19115/-3/mrl/2.0"),
    ("mrs", "http://standards.iso.org/iso/19115/-3/mrs/1.0"),
    ("msr", "http://standards.iso.org/iso/19115/-3/msr/2.0"),
    ("mdq", "http://standards.iso.org/iso/19157/-2/mdq/1.0"),
    ("mac", "http://standards.iso.org/iso/19115/-3/mac/2.0"),
    ("gco", "http://standards.iso.org/iso/19115/-3/gco/1.0"),
    ("gml", "http://www.opengis.net/gml/3.2"),
    ("xlink", "http://www.w3.org/1999/xlink"),
    ("xsi", "http://www.w3.org/2001/XMLSchema-instance"),
];

/// Prefixes every XML processor knows without a declaration.
const IMPLICIT_PREFIXES: &[&str] = &["xml", "xmlns"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceContext {
    bindings: BTreeMap<String, String>,
}

impl Default for NamespaceContext {
    fn default() -> Self {
        NamespaceContext::iso19115_3()
    }
}

impl NamespaceContext {
    pub fn empty() -> Self {
        NamespaceContext {
            bindings: BTreeMap::new(),
        }
    }

    pub fn iso19115_3() -> Self {
        let mut ctx = NamespaceContext::empty();
        for (prefix, uri) in ISO19115_3_NAMESPACES {
            ctx.bind(*prefix, *uri);
        }
        ctx
    }

    /// Bind `prefix` to `uri`, replacing a previous binding of the same prefix.
    pub fn bind(&mut self, prefix: impl Into<String>, uri: impl Into<String>) {
        self.bindings.insert(prefix.into(), uri.into());
    }

    pub fn uri(&self, prefix: &str) -> Option<&str> {
        self.bindings.get(prefix).map(String::as_str)
    }

    pub fn is_bound(&self, prefix: &str) -> bool {
        IMPLICIT_PREFIXES.contains(&prefix) || self.bindings.contains_key(prefix)
    }

    /// Check that the prefix of a qualified name (if any) is known.
    pub fn check_qname(&self, qname: &str) -> Result<(), RecordError> {
        match split_qname(qname) {
            (Some(prefix), _) if !self.is_bound(prefix) => Err(RecordError::Xml(format!(
                "unbound namespace prefix '{prefix}' in '{qname}'"
            ))),
            _ => Ok(()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.bindings.iter().map(|(p, u)| (p.as_str(), u.as_str()))
    }

    /// `xmlns:prefix="uri"` attribute pairs for every binding, in prefix order.
    pub fn declarations(&self) -> Vec<(String, String)> {
        self.iter()
            .map(|(prefix, uri)| (format!("xmlns:{prefix}"), uri.to_string()))
            .collect()
    }
}

/// Split `prefix:local` into its parts. Names without a colon have no prefix.
pub fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_context_knows_record_prefixes() {
        let ctx = NamespaceContext::iso19115_3();
        assert_eq!(ctx.uri("mrl"), Some("http://standards.iso.org/iso/19115/-3/mrl/2.0"));
        assert!(ctx.check_qname("gco:CharacterString").is_ok());
        assert!(ctx.check_qname("xml:lang").is_ok());
        assert!(ctx.check_qname("gn_add").is_ok());
        assert!(ctx.check_qname("foo:bar").is_err());
    }

    #[test]
    fn test_declarations_are_sorted_by_prefix() {
        let mut ctx = NamespaceContext::empty();
        ctx.bind("mri", "urn:mri");
        ctx.bind("gco", "urn:gco");
        let decls = ctx.declarations();
        assert_eq!(decls[0], ("xmlns:gco".to_string(), "urn:gco".to_string()));
        assert_eq!(decls[1].0, "xmlns:mri");
    }
}
