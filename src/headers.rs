//! Pseudo-headers and HTTP/1.1 header lookup
//!
//! Pseudo-headers (`:path`, `:host`, `:version`, ...) travel from the
//! initiator to the acceptor inside the settings header: every entry except
//! `:path` is written as a `name: value\r\n` line and the whole block is
//! Base64 encoded into a single header value.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{Error, Result};

/// Insertion-ordered map of pseudo-header names to values
///
/// Names are matched ASCII case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PseudoHeaders {
    entries: Vec<(String, String)>,
}

impl PseudoHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry, returning the previous value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();

        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Plain-text settings block: one `name: value\r\n` line per entry,
    /// `:path` excluded (it travels on the request line)
    pub fn settings_text(&self) -> String {
        let mut text = String::new();
        for (name, value) in self.iter() {
            if name.eq_ignore_ascii_case(":path") {
                continue;
            }
            text.push_str(name);
            text.push_str(": ");
            text.push_str(value);
            text.push_str("\r\n");
        }
        text
    }

    /// Base64 value for the settings header
    pub fn to_settings_blob(&self) -> String {
        STANDARD.encode(self.settings_text())
    }

    /// Decode a settings header value back into pseudo-headers
    pub fn from_settings_blob(blob: &str) -> Result<Self> {
        let decoded = STANDARD
            .decode(blob.trim())
            .map_err(|_| Error::MalformedSettings("settings value is not valid base64"))?;
        let text = String::from_utf8(decoded)
            .map_err(|_| Error::MalformedSettings("settings value is not valid UTF-8"))?;
        Self::parse_settings_text(&text)
    }

    /// Parse a plain-text settings block
    ///
    /// Each non-empty line must start with `:` and hold a name and a value
    /// separated by a space. A trailing `:` on the name is dropped, so both
    /// `:host: example.com` and `:host example.com` are accepted. Names are
    /// lowercased.
    pub fn parse_settings_text(text: &str) -> Result<Self> {
        let mut headers = Self::new();

        for line in text.split('\n') {
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }
            if !line.starts_with(':') {
                return Err(Error::MalformedSettings("settings line is not a pseudo-header"));
            }

            let (name, value) = line
                .split_once(' ')
                .ok_or(Error::MalformedSettings("settings line has no value"))?;
            let name = name.strip_suffix(':').unwrap_or(name);
            let value = value.trim();

            if name.len() < 2 || value.is_empty() {
                return Err(Error::MalformedSettings("settings line has an empty name or value"));
            }

            headers.insert(name.to_ascii_lowercase(), value);
        }

        Ok(headers)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PseudoHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

impl IntoIterator for PseudoHeaders {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Header fields of a parsed HTTP/1.1 message with lowercased names
///
/// Classification looks headers up by name instead of searching for
/// literal header lines, so whitespace and casing choices made by the peer
/// do not matter.
#[derive(Debug)]
pub(crate) struct HeaderFields<'a> {
    fields: Vec<(String, &'a str)>,
}

impl<'a> HeaderFields<'a> {
    /// Collect fields from a completed `httparse` parse; values that are not
    /// valid UTF-8 are dropped
    pub(crate) fn from_httparse(headers: &[httparse::Header<'a>]) -> Self {
        let fields = headers
            .iter()
            .filter_map(|header| {
                let value = std::str::from_utf8(header.value).ok()?;
                Some((header.name.to_ascii_lowercase(), value.trim()))
            })
            .collect();
        Self { fields }
    }

    /// First value of the named header
    pub(crate) fn get(&self, name: &str) -> Option<&'a str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    /// Whether any header with this name lists `token` in its
    /// comma-separated value
    pub(crate) fn has_token(&self, name: &str, token: &str) -> bool {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}
