//! Identity of a cached image request.

use std::fmt;

use url::Url;

use crate::types::DocumentId;

/// Attributes that partition the cache between browsing contexts. Two loads of the same URI with
/// different attributes never share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct IsolationAttributes {
    pub user_context_id: u32,
    pub private_browsing_id: u32,
    pub first_party_domain: String,
}

impl IsolationAttributes {
    pub fn is_private(&self) -> bool {
        self.private_browsing_id != 0
    }
}

/// Key of the request cache.
///
/// The controlling document only scopes entries for documents served by a service worker
/// style interceptor; it is compared, never dereferenced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    uri: String,
    attrs: IsolationAttributes,
    controlling_document: Option<DocumentId>,
}

impl CacheKey {
    pub fn new(uri: impl Into<String>, attrs: IsolationAttributes) -> Self {
        Self { uri: uri.into(), attrs, controlling_document: None }
    }

    pub fn with_controlling_document(mut self, document: Option<DocumentId>) -> Self {
        self.controlling_document = document;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn attrs(&self) -> &IsolationAttributes {
        &self.attrs
    }

    pub fn controlling_document(&self) -> Option<DocumentId> {
        self.controlling_document
    }

    /// Scheme of the URI, lowercased, without the trailing colon.
    pub fn scheme(&self) -> String {
        scheme_of(&self.uri)
    }

    /// Chrome entries live in their own table and survive content cache clears.
    pub fn is_chrome(&self) -> bool {
        matches!(self.scheme().as_str(), "chrome" | "resource")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)?;
        if self.attrs != IsolationAttributes::default() {
            write!(
                f,
                " [ctx={} pb={} fpd={}]",
                self.attrs.user_context_id,
                self.attrs.private_browsing_id,
                self.attrs.first_party_domain
            )?;
        }
        Ok(())
    }
}

/// Lowercased scheme, or empty for strings that do not parse as absolute URLs.
pub(crate) fn scheme_of(uri: &str) -> String {
    Url::parse(uri).map(|url| url.scheme().to_string()).unwrap_or_default()
}
