//! Element tree with path accessors.
//!
//! An [`Element`] owns its attributes, text and children. Parsed documents
//! and documents produced by [`XmlWriter`](super::XmlWriter) share this
//! representation, so results can be navigated and embedded in requests
//! the same way.
//!
//! # Example
//!
//! ```
//! use mflux_client::xml::Element;
//!
//! let reply = Element::parse_str(
//!     r#"<result><session id="7" timeout="600">ABC123</session></result>"#,
//! ).unwrap();
//!
//! assert_eq!(reply.value("session").unwrap().as_deref(), Some("ABC123"));
//! assert_eq!(reply.int_value("session/@id", -1).unwrap(), 7);
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use chrono::NaiveDateTime;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::path::ElementPath;
use crate::error::{MfluxError, Result};

/// Timestamp format used by the server for date values.
pub const DATE_FORMAT: &str = "%d-%b-%Y %H:%M:%S";

/// Qualified element name: optional namespace prefix plus local name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QName {
    prefix: Option<String>,
    local: String,
}

impl QName {
    /// Split `prefix:local` into its parts. Names without a colon have no
    /// prefix.
    pub fn parse(name: &str) -> Self {
        match name.split_once(':') {
            Some((prefix, local)) if !prefix.is_empty() => Self {
                prefix: Some(prefix.to_string()),
                local: local.to_string(),
            },
            _ => Self {
                prefix: None,
                local: name.to_string(),
            },
        }
    }

    /// Namespace prefix, if any.
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Local part of the name.
    pub fn local(&self) -> &str {
        &self.local
    }

    fn matches(&self, other: &QName) -> bool {
        if self.prefix.is_none() && self.local == "*" {
            return true;
        }
        self == other
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "{}:{}", prefix, self.local),
            None => f.write_str(&self.local),
        }
    }
}

/// A document element.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    name: QName,
    attributes: Vec<(String, String)>,
    text: Option<String>,
    children: Vec<Element>,
}

impl Element {
    /// Create an empty element. A `prefix:local` name is stored qualified.
    pub fn new(name: &str) -> Self {
        Self {
            name: QName::parse(name),
            attributes: Vec::new(),
            text: None,
            children: Vec::new(),
        }
    }

    /// Create an element with text content.
    pub fn with_text(name: &str, text: impl Into<String>) -> Self {
        let mut element = Self::new(name);
        element.text = Some(text.into());
        element
    }

    /// Qualified name as written in a document (`prefix:local`).
    pub fn name(&self) -> String {
        self.name.to_string()
    }

    /// Qualified name parts.
    pub fn qname(&self) -> &QName {
        &self.name
    }

    /// Attributes in insertion order.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Value of a single attribute.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing any existing value for the same name.
    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    /// Text content of this element.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Replace the text content.
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = Some(text.into());
    }

    /// Child elements in document order.
    pub fn children(&self) -> &[Element] {
        &self.children
    }

    /// Append a child element.
    pub fn add_child(&mut self, child: Element) {
        self.children.push(child);
    }

    /// Namespace prefixes used by element names in this subtree.
    pub fn namespaces(&self) -> BTreeSet<&str> {
        let mut prefixes = BTreeSet::new();
        self.collect_namespaces(&mut prefixes);
        prefixes
    }

    fn collect_namespaces<'a>(&'a self, prefixes: &mut BTreeSet<&'a str>) {
        if let Some(prefix) = self.name.prefix() {
            prefixes.insert(prefix);
        }
        for child in &self.children {
            child.collect_namespaces(prefixes);
        }
    }

    // ------------------------------------------------------------------
    // Parsing
    // ------------------------------------------------------------------

    /// Parse a document held in memory.
    ///
    /// Text is kept verbatim. A whitespace-only run is dropped when its
    /// element also has child elements, so indentation never becomes a
    /// value.
    pub fn parse_str(text: &str) -> Result<Element> {
        let mut reader = Reader::from_str(text);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;
        let mut blank: Option<String> = None;

        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    blank = None;
                    stack.push(Self::from_start(&start)?);
                }
                Event::Empty(start) => {
                    blank = None;
                    let element = Self::from_start(&start)?;
                    Self::attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let mut element = stack
                        .pop()
                        .ok_or_else(|| MfluxError::Xml("unexpected end tag".to_string()))?;
                    if let Some(ws) = blank.take() {
                        if element.children.is_empty() {
                            element.text.get_or_insert_with(String::new).push_str(&ws);
                        }
                    }
                    Self::attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    let text = text.unescape()?;
                    Self::append_text(&mut stack, &mut blank, &text)?;
                }
                Event::CData(data) => {
                    let text = String::from_utf8(data.into_inner().into_owned())
                        .map_err(|e| MfluxError::Xml(e.to_string()))?;
                    Self::append_text(&mut stack, &mut blank, &text)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(MfluxError::Xml(format!("unclosed element <{}>", open.name)));
        }
        root.ok_or_else(|| MfluxError::Xml("document has no root element".to_string()))
    }

    /// Parse a document stored in a file.
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Element> {
        let text = std::fs::read_to_string(path)?;
        Self::parse_str(&text)
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Element> {
        let name = std::str::from_utf8(start.name().as_ref())
            .map_err(|e| MfluxError::Xml(e.to_string()))?
            .to_string();
        let mut element = Element::new(&name);

        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| MfluxError::Xml(e.to_string()))?;
            let key = std::str::from_utf8(attribute.key.as_ref())
                .map_err(|e| MfluxError::Xml(e.to_string()))?;
            // Declarations are regenerated on output.
            if key == "xmlns" || key.starts_with("xmlns:") {
                continue;
            }
            let value = attribute.unescape_value()?;
            element.set_attribute(key, value.into_owned());
        }

        Ok(element)
    }

    fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
        if let Some(parent) = stack.last_mut() {
            parent.children.push(element);
        } else if root.is_some() {
            return Err(MfluxError::Xml("multiple root elements".to_string()));
        } else {
            *root = Some(element);
        }
        Ok(())
    }

    /// Whitespace-only runs wait in `blank` until the next event decides
    /// whether they are content or indentation.
    fn append_text(stack: &mut [Element], blank: &mut Option<String>, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            blank.get_or_insert_with(String::new).push_str(text);
            return Ok(());
        }
        match stack.last_mut() {
            Some(current) => {
                let value = current.text.get_or_insert_with(String::new);
                if let Some(ws) = blank.take() {
                    value.push_str(&ws);
                }
                value.push_str(text);
                Ok(())
            }
            None => Err(MfluxError::Xml("text outside root element".to_string())),
        }
    }

    // ------------------------------------------------------------------
    // Path accessors
    // ------------------------------------------------------------------

    fn resolve<'a>(&'a self, path: &ElementPath<'_>) -> Vec<&'a Element> {
        let mut current: Vec<&Element> = vec![self];
        for segment in &path.segments {
            current = current
                .into_iter()
                .flat_map(|e| e.children.iter())
                .filter(|child| segment.matches(&child.name))
                .collect();
            if current.is_empty() {
                break;
            }
        }
        current
    }

    /// Value at `path`: element text, or an attribute for a `/@name`
    /// suffix. `Ok(None)` when nothing matches or the path uses a prefix
    /// not present in this subtree.
    pub fn value(&self, path: &str) -> Result<Option<String>> {
        let path = ElementPath::parse(path)?;
        if !path.uses_only(&self.namespaces()) {
            return Ok(None);
        }

        let found = self.resolve(&path).into_iter().next();
        Ok(found.and_then(|e| match path.attribute {
            Some(attribute) => e.attribute(attribute).map(str::to_owned),
            None => Some(e.text().unwrap_or_default().to_owned()),
        }))
    }

    /// Value at `path`, or `default` when absent.
    pub fn value_or(&self, path: &str, default: &str) -> Result<String> {
        Ok(self.value(path)?.unwrap_or_else(|| default.to_string()))
    }

    /// All values at `path`. Elements lacking a requested attribute are
    /// skipped.
    pub fn values(&self, path: &str) -> Result<Vec<String>> {
        let path = ElementPath::parse(path)?;
        if !path.uses_only(&self.namespaces()) {
            return Ok(Vec::new());
        }

        Ok(self
            .resolve(&path)
            .into_iter()
            .filter_map(|e| match path.attribute {
                Some(attribute) => e.attribute(attribute).map(str::to_owned),
                None => Some(e.text().unwrap_or_default().to_owned()),
            })
            .collect())
    }

    /// Integer value at `path`, or `default` when absent.
    pub fn int_value(&self, path: &str, default: i64) -> Result<i64> {
        match self.value(path)? {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| MfluxError::InvalidValue(format!("{path}: {v:?} is not an integer"))),
            None => Ok(default),
        }
    }

    /// Float value at `path`, or `default` when absent.
    pub fn float_value(&self, path: &str, default: f64) -> Result<f64> {
        match self.value(path)? {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| MfluxError::InvalidValue(format!("{path}: {v:?} is not a number"))),
            None => Ok(default),
        }
    }

    /// Boolean value at `path`. `yes`, `true` and `1` (any case) are true,
    /// anything else is false.
    pub fn bool_value(&self, path: &str, default: bool) -> Result<bool> {
        Ok(match self.value(path)? {
            Some(v) => matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "yes" | "true" | "1"
            ),
            None => default,
        })
    }

    /// Timestamp at `path` in [`DATE_FORMAT`], or `default` when absent.
    pub fn date_value(
        &self,
        path: &str,
        default: Option<NaiveDateTime>,
    ) -> Result<Option<NaiveDateTime>> {
        match self.value(path)? {
            Some(v) => NaiveDateTime::parse_from_str(v.trim(), DATE_FORMAT)
                .map(Some)
                .map_err(|e| MfluxError::InvalidValue(format!("{path}: {v:?}: {e}"))),
            None => Ok(default),
        }
    }

    /// First element at `path`.
    pub fn element(&self, path: &str) -> Result<Option<&Element>> {
        Ok(self.elements(path)?.into_iter().next())
    }

    /// All elements at `path`.
    pub fn elements(&self, path: &str) -> Result<Vec<&Element>> {
        let parsed = ElementPath::parse(path)?;
        if parsed.attribute.is_some() {
            return Err(MfluxError::InvalidPath(format!(
                "{path}: element path cannot select an attribute"
            )));
        }
        if !parsed.uses_only(&self.namespaces()) {
            return Ok(Vec::new());
        }
        Ok(self.resolve(&parsed))
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Serialize this element and its subtree (no XML declaration).
    pub fn to_xml_string(&self) -> String {
        let mut out = String::new();
        let mut declared = Vec::new();
        self.write_xml(&mut out, &mut declared);
        out
    }

    fn write_xml<'a>(&'a self, out: &mut String, declared: &mut Vec<&'a str>) {
        let name = self.name.to_string();
        out.push('<');
        out.push_str(&name);

        let declares = match self.name.prefix() {
            Some(prefix) if !declared.contains(&prefix) => {
                out.push_str(&format!(" xmlns:{prefix}=\"{}\"", escape(prefix)));
                declared.push(prefix);
                true
            }
            _ => false,
        };

        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value.as_str()));
            out.push('"');
        }

        if self.text.is_none() && self.children.is_empty() {
            out.push_str("/>");
        } else {
            out.push('>');
            if let Some(text) = &self.text {
                out.push_str(&escape(text.as_str()));
            }
            for child in &self.children {
                child.write_xml(out, declared);
            }
            out.push_str("</");
            out.push_str(&name);
            out.push('>');
        }

        if declares {
            declared.pop();
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml_string())
    }
}
