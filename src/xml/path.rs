//! Path expressions over an element tree.
//!
//! Grammar: `seg(/seg)*` with an optional trailing `/@attr`, or `@attr` on
//! its own for an attribute of the context element. A segment is a
//! (possibly prefixed) element name or `*`.

use std::collections::BTreeSet;

use super::element::QName;
use crate::error::{MfluxError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ElementPath<'p> {
    pub segments: Vec<QName>,
    pub attribute: Option<&'p str>,
}

impl<'p> ElementPath<'p> {
    pub fn parse(path: &'p str) -> Result<Self> {
        if path.is_empty() {
            return Err(MfluxError::InvalidPath("empty path".to_string()));
        }

        if let Some(attribute) = path.strip_prefix('@') {
            check_attribute(path, attribute)?;
            return Ok(Self {
                segments: Vec::new(),
                attribute: Some(attribute),
            });
        }

        let (elements, attribute) = match path.rfind("/@") {
            Some(idx) => {
                let attribute = &path[idx + 2..];
                check_attribute(path, attribute)?;
                (&path[..idx], Some(attribute))
            }
            None => (path, None),
        };

        let mut segments = Vec::new();
        for segment in elements.split('/') {
            if segment.is_empty() || segment.contains('@') {
                return Err(MfluxError::InvalidPath(path.to_string()));
            }
            segments.push(QName::parse(segment));
        }

        Ok(Self {
            segments,
            attribute,
        })
    }

    /// Returns false if the path names a prefix that is not in `registered`.
    pub fn uses_only(&self, registered: &BTreeSet<&str>) -> bool {
        let segment_prefixes = self.segments.iter().filter_map(QName::prefix);
        let attribute_prefix = self
            .attribute
            .and_then(|a| a.split_once(':'))
            .map(|(prefix, _)| prefix);

        segment_prefixes
            .chain(attribute_prefix)
            .all(|prefix| registered.contains(prefix))
    }
}

fn check_attribute(path: &str, attribute: &str) -> Result<()> {
    if attribute.is_empty() || attribute.contains('/') || attribute.contains('@') {
        return Err(MfluxError::InvalidPath(path.to_string()));
    }
    Ok(())
}
