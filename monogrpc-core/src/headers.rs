//! Ordered header lists as exchanged with the transport.
//!
//! HTTP/2 carries pseudo-headers (`:method`, `:path`, `:status`, ...) in the same
//! block as regular headers, so a plain `http::HeaderMap` cannot represent a
//! header event. [`Headers`] keeps the block as an ordered list of name/value
//! pairs, names lowercased, the way the peer sent it or the way it must go out.

use std::fmt;

pub const METHOD: &str = ":method";
pub const PATH: &str = ":path";
pub const SCHEME: &str = ":scheme";
pub const AUTHORITY: &str = ":authority";
pub const STATUS: &str = ":status";
pub const CONTENT_TYPE: &str = "content-type";

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a header, keeping any earlier header with the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let mut name = name.into();
        name.make_ascii_lowercase();
        self.0.push((name, value.into()));
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Regular headers only, pseudo-headers skipped.
    pub fn regular(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter(|(n, _)| !n.starts_with(':'))
    }
}

impl<N, V> FromIterator<(N, V)> for Headers
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.push(name, value);
        }
        headers
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
