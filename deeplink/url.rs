/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Structured view of a deep-link URL.

use serde::Serialize;

/// Ordered query pairs, percent-decoded. Repeated keys are kept in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    /// First value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for QueryParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// A parsed absolute URL. `raw` is always the exact input string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedUrl {
    pub raw: String,
    /// Lower-cased, without the trailing `:`.
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: QueryParams,
    pub fragment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    MissingScheme,
    Malformed(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty url"),
            Self::MissingScheme => write!(f, "url has no scheme"),
            Self::Malformed(reason) => write!(f, "malformed url: {reason}"),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<::url::ParseError> for ParseError {
    fn from(error: ::url::ParseError) -> Self {
        match error {
            ::url::ParseError::RelativeUrlWithoutBase => Self::MissingScheme,
            other => Self::Malformed(other.to_string()),
        }
    }
}

pub fn parse(raw: &str) -> Result<ParsedUrl, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let url = ::url::Url::parse(raw)?;
    Ok(ParsedUrl {
        raw: raw.to_string(),
        scheme: url.scheme().to_ascii_lowercase(),
        host: url.host_str().unwrap_or("").to_string(),
        path: url.path().to_string(),
        query: url.query_pairs().into_owned().collect(),
        fragment: url.fragment().unwrap_or("").to_string(),
    })
}

/// Standalone helper for hosts that only need the structured view.
pub fn parse_deep_link(url: &str) -> Option<ParsedUrl> {
    parse(url).ok()
}
