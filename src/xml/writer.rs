//! Forward-only document builder.
//!
//! Elements are opened with `push`, closed with `pop`, and leaf elements are
//! written in one step with `add`. Content already written cannot be
//! revisited.
//!
//! # Example
//!
//! ```
//! use mflux_client::xml::XmlWriter;
//!
//! let mut w = XmlWriter::new("args");
//! w.add("domain", "system", &[]);
//! w.push("meta", &[("action", "add")]);
//! w.add("note", "hello", &[]);
//! w.pop();
//!
//! let doc = w.doc_elem().unwrap();
//! assert_eq!(doc.value("meta/note").unwrap().as_deref(), Some("hello"));
//! assert_eq!(doc.value("meta/@action").unwrap().as_deref(), Some("add"));
//! ```

use std::fmt::Display;

use super::element::Element;
use crate::error::{MfluxError, Result};

/// XML declaration prepended to serialized request documents.
pub const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Streaming builder for an [`Element`] tree.
#[derive(Debug, Default)]
pub struct XmlWriter {
    stack: Vec<Element>,
    finished: Vec<Element>,
}

impl XmlWriter {
    /// Create a writer with `root` already open.
    pub fn new(root: &str) -> Self {
        let mut writer = Self::default();
        writer.push(root, &[]);
        writer
    }

    /// Open an element; subsequent content is nested inside it until `pop`.
    pub fn push(&mut self, name: &str, attributes: &[(&str, &str)]) {
        self.stack.push(Self::make(name, attributes));
    }

    /// Write a leaf element with a value.
    pub fn add(&mut self, name: &str, value: impl Display, attributes: &[(&str, &str)]) {
        let mut element = Self::make(name, attributes);
        element.set_text(value.to_string());
        self.attach(element);
    }

    /// Write a copy of an existing element and its subtree.
    pub fn add_element(&mut self, element: &Element) {
        self.attach(element.clone());
    }

    /// Close the innermost open element. Does nothing when none is open.
    pub fn pop(&mut self) {
        if let Some(element) = self.stack.pop() {
            self.attach(element);
        }
    }

    /// Close every open element.
    pub fn pop_all(&mut self) {
        while !self.stack.is_empty() {
            self.pop();
        }
    }

    /// Finish the document and return its root element.
    pub fn doc_elem(mut self) -> Result<Element> {
        self.pop_all();
        let count = self.finished.len();
        match self.finished.pop() {
            Some(root) if count == 1 => Ok(root),
            _ => Err(MfluxError::Xml(format!(
                "document must have exactly one root element, found {count}"
            ))),
        }
    }

    /// Finish the document and serialize it (no XML declaration).
    pub fn doc_text(self) -> Result<String> {
        Ok(self.doc_elem()?.to_xml_string())
    }

    fn make(name: &str, attributes: &[(&str, &str)]) -> Element {
        let mut element = Element::new(name);
        for (key, value) in attributes {
            element.set_attribute(key, *value);
        }
        element
    }

    fn attach(&mut self, element: Element) {
        match self.stack.last_mut() {
            Some(parent) => parent.add_child(element),
            None => self.finished.push(element),
        }
    }
}
