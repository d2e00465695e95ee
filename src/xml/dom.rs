//! A small mutable XML tree.
//!
//! Nodes live in an arena owned by [`XmlDocument`] and are addressed by [`NodeId`]. Node `0`
//! is the document node; the record's root element is its only element child. Element and
//! attribute names are stored as written (`prefix:local`), and prefixes are checked against
//! the [`NamespaceContext`] handed to the parser. Namespace declarations are not stored on
//! nodes: they are emitted from the context when a document or subtree is serialized.

use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    Reader, Writer,
};
use std::{collections::BTreeSet, fmt::Display};

use crate::{
    error::RecordError,
    xml::namespace::{split_qname, NamespaceContext},
};

pub type NodeId = usize;

/// The document node of every [`XmlDocument`].
pub const DOCUMENT_NODE: NodeId = 0;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Document,
    Element {
        name: String,
        attributes: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlDocument {
    nodes: Vec<Node>,
}

impl Default for XmlDocument {
    fn default() -> Self {
        XmlDocument::new()
    }
}

fn xml_err<E: Display>(src: E) -> RecordError {
    RecordError::Xml(format!("{src}"))
}

fn utf8(bytes: &[u8]) -> Result<String, RecordError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| RecordError::Xml(format!("invalid UTF-8 in name: {e}")))
}

impl XmlDocument {
    /// An empty document holding only the document node.
    pub fn new() -> Self {
        XmlDocument {
            nodes: vec![Node {
                kind: NodeKind::Document,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn parse(content: &str, ns: &NamespaceContext) -> Result<Self, RecordError> {
        let mut doc = XmlDocument::new();
        let mut reader = Reader::from_str(content);
        let mut stack: Vec<NodeId> = vec![DOCUMENT_NODE];

        loop {
            let event = reader.read_event().map_err(|e| {
                RecordError::Xml(format!("at byte {}: {e}", reader.buffer_position()))
            })?;
            match event {
                Event::Start(start) => {
                    let id = doc.element_from_start(&start, ns)?;
                    let parent = *stack.last().unwrap_or(&DOCUMENT_NODE);
                    doc.append_child(parent, id)?;
                    stack.push(id);
                }
                Event::Empty(start) => {
                    let id = doc.element_from_start(&start, ns)?;
                    let parent = *stack.last().unwrap_or(&DOCUMENT_NODE);
                    doc.append_child(parent, id)?;
                }
                Event::End(_) => {
                    if stack.len() <= 1 {
                        return Err(RecordError::Xml("unexpected closing tag".to_string()));
                    }
                    if let Some(id) = stack.pop() {
                        doc.drop_indentation(id);
                    }
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(xml_err)?;
                    if stack.len() <= 1 && text.trim().is_empty() {
                        continue;
                    }
                    if stack.len() <= 1 {
                        return Err(RecordError::Xml(
                            "text content outside of the root element".to_string(),
                        ));
                    }
                    let id = doc.push_node(NodeKind::Text(text.into_owned()));
                    doc.append_child(*stack.last().unwrap_or(&DOCUMENT_NODE), id)?;
                }
                Event::CData(data) => {
                    let text = String::from_utf8(data.into_inner().into_owned())?;
                    let id = doc.push_node(NodeKind::Text(text));
                    doc.append_child(*stack.last().unwrap_or(&DOCUMENT_NODE), id)?;
                }
                Event::Eof => break,
                // Declarations, comments, processing instructions and doctypes are dropped.
                _ => {}
            }
        }

        if stack.len() != 1 {
            return Err(RecordError::Xml("unclosed element at end of input".to_string()));
        }
        let roots = doc.element_children(DOCUMENT_NODE).len();
        if roots != 1 {
            return Err(RecordError::Xml(format!(
                "expected exactly one root element, found {roots}"
            )));
        }
        Ok(doc)
    }

    fn element_from_start(
        &mut self,
        start: &BytesStart<'_>,
        ns: &NamespaceContext,
    ) -> Result<NodeId, RecordError> {
        let name = utf8(start.name().as_ref())?;
        ns.check_qname(&name)?;
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(xml_err)?;
            let key = utf8(attr.key.as_ref())?;
            let value = attr.unescape_value().map_err(xml_err)?.into_owned();
            if let Some(prefix) = key.strip_prefix("xmlns:") {
                match ns.uri(prefix) {
                    Some(uri) if uri == value => continue,
                    Some(uri) => {
                        return Err(RecordError::Xml(format!(
                            "prefix '{prefix}' is bound to '{value}' but the namespace context expects '{uri}'"
                        )))
                    }
                    None => {
                        return Err(RecordError::Xml(format!(
                            "prefix '{prefix}' ('{value}') is unknown to the namespace context"
                        )))
                    }
                }
            }
            if key != "xmlns" {
                ns.check_qname(&key)?;
            }
            attributes.push((key, value));
        }
        Ok(self.push_node(NodeKind::Element { name, attributes }))
    }

    /// Remove whitespace-only text children of an element that also has element children.
    /// Whitespace that is an element's only content is a value and stays.
    fn drop_indentation(&mut self, id: NodeId) {
        let has_elements = self.children(id).iter().any(|&child| self.is_element(child));
        if !has_elements {
            return;
        }
        let blank: Vec<NodeId> = self
            .children(id)
            .iter()
            .copied()
            .filter(|&child| {
                matches!(self.kind(child), Some(NodeKind::Text(text)) if text.trim().is_empty())
            })
            .collect();
        if blank.is_empty() {
            return;
        }
        for &child in &blank {
            if let Some(node) = self.nodes.get_mut(child) {
                node.parent = None;
            }
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.children.retain(|child| !blank.contains(child));
        }
    }

    fn push_node(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    fn node(&self, id: NodeId) -> Result<&Node, RecordError> {
        self.nodes
            .get(id)
            .ok_or_else(|| RecordError::Xml(format!("no node with id {id}")))
    }

    pub fn root(&self) -> Option<NodeId> {
        self.element_children(DOCUMENT_NODE).first().copied()
    }

    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.nodes.get(id).map(|n| &n.kind)
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        matches!(self.kind(id), Some(NodeKind::Element { .. }))
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        match self.kind(id) {
            Some(NodeKind::Element { name, .. }) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn element_children(&self, id: NodeId) -> Vec<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .filter(|c| self.is_element(*c))
            .collect()
    }

    /// Element descendants of `id` in document order, `id` excluded.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.element_children(id).into_iter().rev().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.element_children(next).into_iter().rev());
        }
        out
    }

    pub fn attribute(&self, id: NodeId, key: &str) -> Option<&str> {
        match self.kind(id) {
            Some(NodeKind::Element { attributes, .. }) => attributes
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    pub fn attributes(&self, id: NodeId) -> &[(String, String)] {
        match self.kind(id) {
            Some(NodeKind::Element { attributes, .. }) => attributes.as_slice(),
            _ => &[],
        }
    }

    pub fn set_attribute(
        &mut self,
        id: NodeId,
        key: &str,
        value: impl Into<String>,
    ) -> Result<(), RecordError> {
        let value = value.into();
        match self.nodes.get_mut(id).map(|n| &mut n.kind) {
            Some(NodeKind::Element { attributes, .. }) => {
                match attributes.iter_mut().find(|(k, _)| k == key) {
                    Some(entry) => entry.1 = value,
                    None => attributes.push((key.to_string(), value)),
                }
                Ok(())
            }
            _ => Err(RecordError::Xml(format!(
                "cannot set attribute '{key}' on non-element node {id}"
            ))),
        }
    }

    pub fn remove_attribute(&mut self, id: NodeId, key: &str) -> Result<(), RecordError> {
        match self.nodes.get_mut(id).map(|n| &mut n.kind) {
            Some(NodeKind::Element { attributes, .. }) => {
                attributes.retain(|(k, _)| k != key);
                Ok(())
            }
            _ => Err(RecordError::Xml(format!(
                "cannot remove attribute '{key}' from non-element node {id}"
            ))),
        }
    }

    /// Text held directly by `id` (text children concatenated).
    pub fn text(&self, id: NodeId) -> String {
        self.children(id)
            .iter()
            .filter_map(|c| match self.kind(*c) {
                Some(NodeKind::Text(t)) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// All text below `id`, in document order.
    pub fn string_value(&self, id: NodeId) -> String {
        match self.kind(id) {
            Some(NodeKind::Text(t)) => t.clone(),
            _ => self
                .children(id)
                .iter()
                .map(|c| self.string_value(*c))
                .collect(),
        }
    }

    /// Replace the direct text of `id`, keeping its element children.
    pub fn set_text(&mut self, id: NodeId, value: impl Into<String>) -> Result<(), RecordError> {
        if !self.is_element(id) {
            return Err(RecordError::Xml(format!(
                "cannot set text on non-element node {id}"
            )));
        }
        let text_children: Vec<NodeId> = self
            .children(id)
            .iter()
            .copied()
            .filter(|c| matches!(self.kind(*c), Some(NodeKind::Text(_))))
            .collect();
        for child in text_children {
            self.detach(child)?;
        }
        let text = self.push_node(NodeKind::Text(value.into()));
        self.insert_child(id, 0, text)
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), RecordError> {
        let index = self.node(parent)?.children.len();
        self.insert_child(parent, index, child)
    }

    /// Insert a detached node at `index` among the children of `parent`.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        index: usize,
        child: NodeId,
    ) -> Result<(), RecordError> {
        if self.node(child)?.parent.is_some() {
            return Err(RecordError::Xml(format!(
                "node {child} is already attached; detach it first"
            )));
        }
        if child == DOCUMENT_NODE || self.is_ancestor_or_self(child, parent) {
            return Err(RecordError::Xml(format!(
                "cannot insert node {child} below itself"
            )));
        }
        let siblings = &mut self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| RecordError::Xml(format!("no node with id {parent}")))?
            .children;
        if index > siblings.len() {
            return Err(RecordError::Xml(format!(
                "child index {index} out of bounds for node {parent}"
            )));
        }
        siblings.insert(index, child);
        self.nodes[child].parent = Some(parent);
        Ok(())
    }

    fn is_ancestor_or_self(&self, ancestor: NodeId, mut id: NodeId) -> bool {
        loop {
            if id == ancestor {
                return true;
            }
            match self.parent(id) {
                Some(p) => id = p,
                None => return false,
            }
        }
    }

    pub fn index_of(&self, parent: NodeId, child: NodeId) -> Option<usize> {
        self.children(parent).iter().position(|c| *c == child)
    }

    /// Unlink `id` from its parent. The node stays in the arena and may be reinserted.
    pub fn detach(&mut self, id: NodeId) -> Result<(), RecordError> {
        if let Some(parent) = self.node(id)?.parent {
            self.nodes[parent].children.retain(|c| *c != id);
            self.nodes[id].parent = None;
        }
        Ok(())
    }

    /// Deep-copy the subtree rooted at `node` of `other` into this arena, detached.
    pub fn import(&mut self, other: &XmlDocument, node: NodeId) -> Result<NodeId, RecordError> {
        let kind = other.node(node)?.kind.clone();
        if kind == NodeKind::Document {
            return Err(RecordError::Xml("cannot import a document node".to_string()));
        }
        let id = self.push_node(kind);
        for child in other.children(node).to_vec() {
            let copy = self.import(other, child)?;
            self.append_child(id, copy)?;
        }
        Ok(id)
    }

    /// Rank of every attached node in document order, indexed by [`NodeId`].
    /// Detached nodes get `usize::MAX`.
    pub fn document_order(&self) -> Vec<usize> {
        let mut ranks = vec![usize::MAX; self.nodes.len()];
        let mut counter = 0;
        let mut stack = vec![DOCUMENT_NODE];
        while let Some(id) = stack.pop() {
            ranks[id] = counter;
            counter += 1;
            stack.extend(self.children(id).iter().rev());
        }
        ranks
    }

    fn used_prefixes(&self, id: NodeId, prefixes: &mut BTreeSet<String>) {
        if let Some(NodeKind::Element { name, attributes }) = self.kind(id) {
            if let (Some(prefix), _) = split_qname(name) {
                prefixes.insert(prefix.to_string());
            }
            for (key, _) in attributes {
                if let (Some(prefix), _) = split_qname(key) {
                    prefixes.insert(prefix.to_string());
                }
            }
        }
        for child in self.children(id) {
            self.used_prefixes(*child, prefixes);
        }
    }

    fn declarations_for(
        &self,
        id: NodeId,
        ns: &NamespaceContext,
    ) -> Result<Vec<(String, String)>, RecordError> {
        let mut prefixes = BTreeSet::new();
        self.used_prefixes(id, &mut prefixes);
        let mut declarations = Vec::new();
        for prefix in prefixes {
            if prefix == "xml" || prefix == "xmlns" {
                continue;
            }
            let uri = ns.uri(&prefix).ok_or_else(|| {
                RecordError::Xml(format!("prefix '{prefix}' is unknown to the namespace context"))
            })?;
            declarations.push((format!("xmlns:{prefix}"), uri.to_string()));
        }
        Ok(declarations)
    }

    /// Serialize the whole document with an XML declaration and two-space indentation.
    pub fn to_xml_string(&self, ns: &NamespaceContext) -> Result<String, RecordError> {
        let root = self
            .root()
            .ok_or_else(|| RecordError::Xml("document has no root element".to_string()))?;
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;
        let declarations = self.declarations_for(root, ns)?;
        self.write_node(&mut writer, root, &declarations)?;
        let mut out = String::from_utf8(writer.into_inner())?;
        out.push('\n');
        Ok(out)
    }

    /// Serialize one subtree on a single line, declaring the namespaces it uses on its root.
    pub fn subtree_to_string(&self, id: NodeId, ns: &NamespaceContext) -> Result<String, RecordError> {
        let mut writer = Writer::new(Vec::new());
        let declarations = self.declarations_for(id, ns)?;
        self.write_node(&mut writer, id, &declarations)?;
        Ok(String::from_utf8(writer.into_inner())?)
    }

    fn write_node(
        &self,
        writer: &mut Writer<Vec<u8>>,
        id: NodeId,
        declarations: &[(String, String)],
    ) -> Result<(), RecordError> {
        match &self.node(id)?.kind {
            NodeKind::Document => {
                for child in self.children(id) {
                    self.write_node(writer, *child, &[])?;
                }
            }
            NodeKind::Text(text) => {
                writer
                    .write_event(Event::Text(BytesText::new(text)))
                    .map_err(xml_err)?;
            }
            NodeKind::Element { name, attributes } => {
                let mut start = BytesStart::new(name.as_str());
                for (key, value) in declarations.iter().chain(attributes.iter()) {
                    start.push_attribute((key.as_str(), value.as_str()));
                }
                let children = self.children(id);
                if children.is_empty() {
                    writer.write_event(Event::Empty(start)).map_err(xml_err)?;
                } else {
                    writer.write_event(Event::Start(start)).map_err(xml_err)?;
                    for child in children {
                        self.write_node(writer, *child, &[])?;
                    }
                    writer
                        .write_event(Event::End(BytesEnd::new(name.as_str())))
                        .map_err(xml_err)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> NamespaceContext {
        NamespaceContext::iso19115_3()
    }

    #[test]
    fn test_parse_and_navigate() {
        let doc = XmlDocument::parse(
            r#"<mri:keyword>
                 <gco:CharacterString>Paris &amp; suburbs</gco:CharacterString>
               </mri:keyword>"#,
            &ns(),
        )
        .unwrap();
        let root = doc.root().unwrap();
        assert_eq!(doc.name(root), Some("mri:keyword"));
        let inner = doc.element_children(root)[0];
        assert_eq!(doc.text(inner), "Paris & suburbs");
        // Indentation is not kept as text.
        assert_eq!(doc.children(root).len(), 1);
    }

    #[test]
    fn test_known_declarations_are_dropped_and_unknown_rejected() {
        let doc = XmlDocument::parse(
            r#"<mrl:source xmlns:mrl="http://standards.iso.org/iso/19115/-3/mrl/2.0" uuidref="x"/>"#,
            &ns(),
        )
        .unwrap();
        let root = doc.root().unwrap();
        assert_eq!(doc.attributes(root).len(), 1);

        let err = XmlDocument::parse(r#"<foo:bar/>"#, &ns()).unwrap_err();
        assert!(matches!(err, RecordError::Xml(_)));
        let err = XmlDocument::parse(r#"<mrl:source xmlns:mrl="urn:other"/>"#, &ns()).unwrap_err();
        assert!(matches!(err, RecordError::Xml(_)));
    }

    #[test]
    fn test_rejects_multiple_roots() {
        assert!(XmlDocument::parse("<a/><b/>", &NamespaceContext::empty()).is_err());
        assert!(XmlDocument::parse("<a>", &NamespaceContext::empty()).is_err());
    }

    #[test]
    fn test_serialization_round_trip_keeps_literal_text() {
        let ctx = ns();
        let mut doc = XmlDocument::parse("<gco:CharacterString/>", &ctx).unwrap();
        let root = doc.root().unwrap();
        let literal = r#"  a <b> & "c" 'd'  "#;
        doc.set_text(root, literal).unwrap();
        let xml = doc.to_xml_string(&ctx).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains(r#"xmlns:gco="http://standards.iso.org/iso/19115/-3/gco/1.0""#));
        let reparsed = XmlDocument::parse(&xml, &ctx).unwrap();
        assert_eq!(reparsed.text(reparsed.root().unwrap()), literal);
    }

    #[test]
    fn test_whitespace_is_kept_only_as_sole_content() {
        let ctx = ns();
        let doc = XmlDocument::parse(
            "<mri:abstract>\n  <gco:CharacterString>   </gco:CharacterString>\n  <gco:CharacterString>\t</gco:CharacterString>\n</mri:abstract>",
            &ctx,
        )
        .unwrap();
        let root = doc.root().unwrap();
        // Indentation between elements is dropped.
        assert_eq!(doc.children(root).len(), 2);
        let texts: Vec<String> = doc
            .element_children(root)
            .into_iter()
            .map(|id| doc.text(id))
            .collect();
        assert_eq!(texts, vec!["   ", "\t"]);
    }

    #[test]
    fn test_subtree_declares_only_used_prefixes() {
        let ctx = ns();
        let doc = XmlDocument::parse(
            "<mri:associatedResource><mri:MD_AssociatedResource><mri:metadataReference uuidref=\"u\"/></mri:MD_AssociatedResource></mri:associatedResource>",
            &ctx,
        )
        .unwrap();
        let inner = doc.element_children(doc.root().unwrap())[0];
        let out = doc.subtree_to_string(inner, &ctx).unwrap();
        assert_eq!(
            out,
            "<mri:MD_AssociatedResource xmlns:mri=\"http://standards.iso.org/iso/19115/-3/mri/1.0\"><mri:metadataReference uuidref=\"u\"/></mri:MD_AssociatedResource>"
        );
    }

    #[test]
    fn test_import_and_insert() {
        let ctx = NamespaceContext::empty();
        let mut base = XmlDocument::parse("<root><a/><c/></root>", &ctx).unwrap();
        let fragment = XmlDocument::parse("<b><d>x</d></b>", &ctx).unwrap();
        let root = base.root().unwrap();
        let copy = base.import(&fragment, fragment.root().unwrap()).unwrap();
        base.insert_child(root, 1, copy).unwrap();
        let names: Vec<_> = base
            .element_children(root)
            .into_iter()
            .map(|c| base.name(c).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(base.insert_child(root, 0, copy).is_err());
        assert_eq!(base.string_value(root), "x");
    }

    #[test]
    fn test_set_text_keeps_element_children() {
        let ctx = NamespaceContext::empty();
        let mut doc = XmlDocument::parse("<a>old<b/></a>", &ctx).unwrap();
        let root = doc.root().unwrap();
        doc.set_text(root, "new").unwrap();
        assert_eq!(doc.text(root), "new");
        assert_eq!(doc.element_children(root).len(), 1);
    }
}
