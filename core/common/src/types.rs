//! Common types used throughout InvoiceDrop.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters escaped inside a path segment of a path-addressed drive URL.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// A logical path in the remote drive (folder components plus file name).
///
/// This type represents remote paths only; it never touches the local
/// filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotePath {
    components: Vec<String>,
}

impl RemotePath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Preconditions
    /// - Components must not contain path separators
    /// - Components must not be empty strings
    ///
    /// # Errors
    /// - Returns error if any component is invalid
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a path string into RemotePath.
    ///
    /// Uses '/' as separator.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let path = path.trim_start_matches('/').trim_end_matches('/');
        if path.is_empty() {
            return Ok(Self::root());
        }

        let components: Vec<String> = path.split('/').map(String::from).collect();
        Self::from_components(components)
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the file/folder name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }

    /// The path with every component percent-escaped (spaces become `%20`),
    /// ready to splice into a path-addressed URL.
    pub fn escaped(&self) -> String {
        if self.is_root() {
            return "/".to_string();
        }
        self.components
            .iter()
            .map(|c| format!("/{}", utf8_percent_encode(c, PATH_SEGMENT)))
            .collect()
    }
}

fn validate_component(comp: &str) -> crate::Result<()> {
    if comp.is_empty() {
        return Err(crate::Error::InvalidInput(
            "Path component cannot be empty".to_string(),
        ));
    }
    if comp.contains('/') || comp.contains('\\') {
        return Err(crate::Error::InvalidInput(
            "Path component cannot contain separators".to_string(),
        ));
    }
    if comp == "." || comp == ".." {
        return Err(crate::Error::InvalidInput(format!(
            "Path component cannot be '{}'",
            comp
        )));
    }
    Ok(())
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_path_root() {
        let path = RemotePath::root();
        assert!(path.is_root());
        assert_eq!(path.to_string_path(), "/");
        assert_eq!(path.escaped(), "/");
    }

    #[test]
    fn test_remote_path_parse() {
        let path = RemotePath::parse("/Invoices/InvoiceData/a.json").unwrap();
        assert_eq!(path.components(), &["Invoices", "InvoiceData", "a.json"]);
        assert_eq!(path.to_string_path(), "/Invoices/InvoiceData/a.json");
        assert_eq!(RemotePath::parse("Invoices/").unwrap().to_string_path(), "/Invoices");
    }

    #[test]
    fn test_remote_path_rejects_empty_and_dot_components() {
        assert!(RemotePath::parse("/Invoices//a.pdf").is_err());
        assert!(RemotePath::parse("/Invoices/../a.pdf").is_err());
        assert!(RemotePath::root().join("a\\b").is_err());
    }

    #[test]
    fn test_remote_path_join_and_parent() {
        let path = RemotePath::root().join("Invoices").unwrap().join("a.pdf").unwrap();
        assert_eq!(path.to_string_path(), "/Invoices/a.pdf");
        assert_eq!(path.name(), Some("a.pdf"));
        assert_eq!(path.parent().unwrap().to_string_path(), "/Invoices");
    }

    #[test]
    fn test_escaped_encodes_spaces() {
        let path = RemotePath::parse("/My Invoices/Q1 report.pdf").unwrap();
        assert_eq!(path.escaped(), "/My%20Invoices/Q1%20report.pdf");
        // The logical form stays unescaped.
        assert_eq!(path.to_string_path(), "/My Invoices/Q1 report.pdf");
    }

    #[test]
    fn test_escaped_encodes_url_delimiters() {
        let path = RemotePath::parse("/Invoices/a#1?.pdf").unwrap();
        assert_eq!(path.escaped(), "/Invoices/a%231%3F.pdf");
    }

    #[test]
    fn test_escaped_keeps_non_ascii_as_utf8() {
        let path = RemotePath::parse("/Facturas/año.pdf").unwrap();
        assert_eq!(path.escaped(), "/Facturas/a%C3%B1o.pdf");
    }
}
