//! Locators: the XPath subset used to address nodes in templates and records.
//!
//! Supported syntax:
//!
//! - absolute (`/a/b`), descendant (`//a`) and relative (`./a`, `.//a`, `a/b`) paths;
//! - name tests with prefixes (`mri:keyword`), `*`, `.` and `..`;
//! - a terminal attribute step (`a/@uuidref`);
//! - predicates: position (`[2]`), existence (`[mri:citation]`, `[@uuidref]`), comparison
//!   (`[@a='v']`, `[b/@a!='v']`, `[b='v']`), `starts-with(path, 'v')`,
//!   `contains(path, 'v')`, joined with `and` / `or`.
//!
//! Comparisons follow XPath node-set semantics: `[b='v']` holds when any selected `b` has
//! the string value `v`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

use crate::{
    error::RecordError,
    xml::{
        dom::{NodeId, XmlDocument, DOCUMENT_NODE},
        namespace::NamespaceContext,
    },
};

static FUNCTION_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(starts-with|contains)\(\s*(.+?)\s*,\s*('[^']*'|"[^"]*")\s*\)$"#)
        .expect("function call pattern is valid")
});

static QNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[A-Za-z_][\w.\-]*:)?[A-Za-z_][\w.\-]*$").expect("qname pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    /// Introduced by `//`: descendant-or-self of the context, then the step's test.
    Descendant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeTest {
    Name(String),
    Wildcard,
    SelfNode,
    Parent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    axis: Axis,
    test: NodeTest,
    predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Comparison {
    Equal,
    NotEqual,
    StartsWith,
    Contains,
}

impl Comparison {
    fn holds(&self, value: &str, literal: &str) -> bool {
        match self {
            Comparison::Equal => value == literal,
            Comparison::NotEqual => value != literal,
            Comparison::StartsWith => value.starts_with(literal),
            Comparison::Contains => value.contains(literal),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Predicate {
    Position(usize),
    Exists(Locator),
    Compare {
        path: Locator,
        op: Comparison,
        literal: String,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    source: String,
    absolute: bool,
    steps: Vec<Step>,
    attribute: Option<String>,
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn locator_err(locator: &str, message: impl Into<String>) -> RecordError {
    RecordError::Locator {
        locator: locator.to_string(),
        message: message.into(),
    }
}

/// Split `text` on `separator` where it occurs outside quotes, brackets and parentheses.
fn split_top_level<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let bytes = text.as_bytes();
    let sep = separator.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'[' | b'(' => depth += 1,
                b']' | b')' => depth = depth.saturating_sub(1),
                _ if depth == 0 && bytes[i..].starts_with(sep) => {
                    parts.push(&text[start..i]);
                    i += sep.len();
                    start = i;
                    continue;
                }
                _ => {}
            },
        }
        i += 1;
    }
    parts.push(&text[start..]);
    parts
}

fn parse_literal(text: &str) -> Option<String> {
    let text = text.trim();
    let quoted = (text.starts_with('\'') && text.ends_with('\''))
        || (text.starts_with('"') && text.ends_with('"'));
    if quoted && text.len() >= 2 {
        Some(text[1..text.len() - 1].to_string())
    } else {
        None
    }
}

impl Locator {
    pub fn parse(expr: &str, ns: &NamespaceContext) -> Result<Self, RecordError> {
        let source = expr.trim();
        if source.is_empty() {
            return Err(locator_err(expr, "empty locator"));
        }
        let mut locator = Locator {
            source: source.to_string(),
            absolute: false,
            steps: Vec::new(),
            attribute: None,
        };
        if source == "/" {
            locator.absolute = true;
            return Ok(locator);
        }

        let segments = split_top_level(source, "/");
        let mut axis = Axis::Child;
        for (index, segment) in segments.iter().enumerate() {
            let segment = segment.trim();
            if segment.is_empty() {
                match index {
                    0 => locator.absolute = true,
                    _ if index + 1 == segments.len() => {
                        return Err(locator_err(source, "trailing '/'"))
                    }
                    _ if axis == Axis::Descendant => {
                        return Err(locator_err(source, "unexpected '/'"))
                    }
                    _ => axis = Axis::Descendant,
                }
                continue;
            }
            if locator.attribute.is_some() {
                return Err(locator_err(source, "an attribute step must be last"));
            }
            if let Some(name) = segment.strip_prefix('@') {
                if axis == Axis::Descendant {
                    return Err(locator_err(source, "'//@attribute' is not supported"));
                }
                if !QNAME.is_match(name) {
                    return Err(locator_err(source, format!("invalid attribute name '{name}'")));
                }
                ns.check_qname(name)
                    .map_err(|e| locator_err(source, e.to_string()))?;
                locator.attribute = Some(name.to_string());
                continue;
            }
            locator.steps.push(Locator::parse_step(source, segment, axis, ns)?);
            axis = Axis::Child;
        }
        Ok(locator)
    }

    fn parse_step(
        source: &str,
        segment: &str,
        axis: Axis,
        ns: &NamespaceContext,
    ) -> Result<Step, RecordError> {
        let (test, mut rest) = match segment.find('[') {
            Some(i) => (&segment[..i], &segment[i..]),
            None => (segment, ""),
        };
        let test = match test.trim() {
            "." => NodeTest::SelfNode,
            ".." => NodeTest::Parent,
            "*" => NodeTest::Wildcard,
            name if QNAME.is_match(name) => {
                ns.check_qname(name)
                    .map_err(|e| locator_err(source, e.to_string()))?;
                NodeTest::Name(name.to_string())
            }
            other => return Err(locator_err(source, format!("invalid step '{other}'"))),
        };

        let mut predicates = Vec::new();
        while !rest.is_empty() {
            if !rest.starts_with('[') {
                return Err(locator_err(source, format!("unexpected '{rest}'")));
            }
            let close = Locator::matching_bracket(rest)
                .ok_or_else(|| locator_err(source, "unbalanced '['"))?;
            predicates.push(Locator::parse_predicate(source, &rest[1..close], ns)?);
            rest = &rest[close + 1..];
        }
        Ok(Step {
            axis,
            test,
            predicates,
        })
    }

    fn matching_bracket(text: &str) -> Option<usize> {
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        for (i, c) in text.char_indices() {
            match quote {
                Some(q) if c == q => quote = None,
                Some(_) => {}
                None => match c {
                    '\'' | '"' => quote = Some(c),
                    '[' => depth += 1,
                    ']' => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(i);
                        }
                    }
                    _ => {}
                },
            }
        }
        None
    }

    fn parse_predicate(
        source: &str,
        text: &str,
        ns: &NamespaceContext,
    ) -> Result<Predicate, RecordError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(locator_err(source, "empty predicate"));
        }
        let alternatives = split_top_level(text, " or ");
        if alternatives.len() > 1 {
            return alternatives
                .into_iter()
                .map(|alt| Locator::parse_predicate(source, alt, ns))
                .collect::<Result<Vec<_>, _>>()
                .map(Predicate::Or);
        }
        let conjuncts = split_top_level(text, " and ");
        if conjuncts.len() > 1 {
            return conjuncts
                .into_iter()
                .map(|c| Locator::parse_predicate(source, c, ns))
                .collect::<Result<Vec<_>, _>>()
                .map(Predicate::And);
        }

        if let Ok(position) = text.parse::<usize>() {
            if position == 0 {
                return Err(locator_err(source, "positions start at 1"));
            }
            return Ok(Predicate::Position(position));
        }

        if let Some(captures) = FUNCTION_CALL.captures(text) {
            let op = match &captures[1] {
                "starts-with" => Comparison::StartsWith,
                _ => Comparison::Contains,
            };
            let literal = parse_literal(&captures[3])
                .ok_or_else(|| locator_err(source, "function argument must be a literal"))?;
            return Ok(Predicate::Compare {
                path: Locator::parse_relative(source, &captures[2], ns)?,
                op,
                literal,
            });
        }

        let not_equal = split_top_level(text, "!=");
        let (parts, op) = if not_equal.len() == 2 {
            (not_equal, Comparison::NotEqual)
        } else {
            (split_top_level(text, "="), Comparison::Equal)
        };
        match parts.as_slice() {
            [path] => Ok(Predicate::Exists(Locator::parse_relative(source, path, ns)?)),
            [path, literal] => {
                let literal = parse_literal(literal).ok_or_else(|| {
                    locator_err(source, format!("expected a quoted literal in '{text}'"))
                })?;
                Ok(Predicate::Compare {
                    path: Locator::parse_relative(source, path, ns)?,
                    op,
                    literal,
                })
            }
            _ => Err(locator_err(source, format!("cannot parse predicate '{text}'"))),
        }
    }

    fn parse_relative(
        source: &str,
        path: &str,
        ns: &NamespaceContext,
    ) -> Result<Locator, RecordError> {
        let path = path.trim();
        if path.starts_with('/') {
            return Err(locator_err(source, "predicate paths must be relative"));
        }
        let inner = if path.starts_with('@') {
            // A bare attribute test applies to the candidate itself.
            Locator {
                source: path.to_string(),
                absolute: false,
                steps: Vec::new(),
                attribute: None,
            }
            .with_attribute(path, ns)?
        } else {
            Locator::parse(path, ns)?
        };
        Ok(inner)
    }

    fn with_attribute(mut self, path: &str, ns: &NamespaceContext) -> Result<Self, RecordError> {
        let name = &path[1..];
        if !QNAME.is_match(name) {
            return Err(locator_err(path, format!("invalid attribute name '{name}'")));
        }
        ns.check_qname(name)
            .map_err(|e| locator_err(path, e.to_string()))?;
        self.attribute = Some(name.to_string());
        Ok(self)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The attribute named by a terminal `@name` step, if any.
    pub fn attribute(&self) -> Option<&str> {
        self.attribute.as_deref()
    }

    /// Element nodes selected by this locator from `context`, in document order.
    ///
    /// Absolute locators ignore `context` and start from the document node. With a terminal
    /// attribute step, the owning elements that carry the attribute are returned.
    pub fn select(&self, doc: &XmlDocument, context: NodeId) -> Vec<NodeId> {
        let order = doc.document_order();
        self.select_with_order(doc, context, &order)
    }

    fn select_with_order(&self, doc: &XmlDocument, context: NodeId, order: &[usize]) -> Vec<NodeId> {
        let mut current = vec![if self.absolute { DOCUMENT_NODE } else { context }];
        for step in &self.steps {
            let mut next = Vec::new();
            for node in &current {
                let bases = match step.axis {
                    Axis::Child => vec![*node],
                    Axis::Descendant => {
                        let mut all = vec![*node];
                        all.extend(doc.descendants(*node));
                        all
                    }
                };
                // Positions count among the candidates of one base node.
                for base in bases {
                    let mut candidates: Vec<NodeId> = match &step.test {
                        NodeTest::SelfNode => vec![base],
                        NodeTest::Parent => doc.parent(base).into_iter().collect(),
                        NodeTest::Wildcard => doc.element_children(base),
                        NodeTest::Name(name) => doc
                            .element_children(base)
                            .into_iter()
                            .filter(|c| doc.name(*c) == Some(name.as_str()))
                            .collect(),
                    };
                    for predicate in &step.predicates {
                        let count = candidates.len();
                        candidates = candidates
                            .into_iter()
                            .enumerate()
                            .filter(|(i, c)| predicate.holds(doc, *c, i + 1, count, order))
                            .map(|(_, c)| c)
                            .collect();
                    }
                    next.extend(candidates);
                }
            }
            next.sort_by_key(|id| order.get(*id).copied().unwrap_or(usize::MAX));
            next.dedup();
            current = next;
        }
        match &self.attribute {
            Some(attr) => current
                .into_iter()
                .filter(|id| doc.attribute(*id, attr).is_some())
                .collect(),
            None => current,
        }
    }

    /// String values of the selection: attribute values with a terminal attribute step,
    /// element string values otherwise.
    pub fn values(&self, doc: &XmlDocument, context: NodeId) -> Vec<String> {
        let order = doc.document_order();
        self.values_with_order(doc, context, &order)
    }

    fn values_with_order(&self, doc: &XmlDocument, context: NodeId, order: &[usize]) -> Vec<String> {
        let selected = self.select_with_order(doc, context, order);
        match &self.attribute {
            Some(attr) => selected
                .into_iter()
                .filter_map(|id| doc.attribute(id, attr).map(str::to_string))
                .collect(),
            None => selected.into_iter().map(|id| doc.string_value(id)).collect(),
        }
    }
}

impl Predicate {
    fn holds(
        &self,
        doc: &XmlDocument,
        node: NodeId,
        position: usize,
        count: usize,
        order: &[usize],
    ) -> bool {
        match self {
            Predicate::Position(p) => *p == position && *p <= count,
            Predicate::Exists(path) => !path.select_with_order(doc, node, order).is_empty(),
            Predicate::Compare { path, op, literal } => path
                .values_with_order(doc, node, order)
                .iter()
                .any(|value| op.holds(value, literal)),
            Predicate::And(all) => all
                .iter()
                .all(|p| p.holds(doc, node, position, count, order)),
            Predicate::Or(any) => any
                .iter()
                .any(|p| p.holds(doc, node, position, count, order)),
        }
    }
}
