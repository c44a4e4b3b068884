use std::collections::BTreeSet;

/// The URL schemes this application accepts deep links for.
///
/// Built once during setup and never mutated afterwards; unregistering a
/// scheme at the OS level does not remove it from the set for the rest of the
/// process run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolSet {
    schemes: BTreeSet<String>,
}

impl ProtocolSet {
    pub fn new<I, S>(schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        schemes.into_iter().collect()
    }

    pub fn contains(&self, scheme: &str) -> bool {
        normalize_scheme(scheme).is_some_and(|scheme| self.schemes.contains(&scheme))
    }

    /// Whether `arg` starts with `<registered scheme>://`.
    pub fn matches_url(&self, arg: &str) -> bool {
        arg.split_once("://")
            .is_some_and(|(scheme, _)| self.contains(scheme))
    }

    pub fn scheme_ids(&self) -> Vec<String> {
        self.schemes.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.schemes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.schemes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemes.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for ProtocolSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut schemes = BTreeSet::new();
        for scheme in iter {
            match normalize_scheme(scheme.as_ref()) {
                Some(normalized) => {
                    schemes.insert(normalized);
                }
                None => log::warn!("ignoring invalid protocol scheme '{}'", scheme.as_ref()),
            }
        }
        Self { schemes }
    }
}

/// Lower-cases and strips a trailing `:` or `://`. Rejects anything that is
/// not a valid URL scheme.
fn normalize_scheme(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_suffix("://")
        .or_else(|| trimmed.strip_suffix(':'))
        .unwrap_or(trimmed);

    let mut chars = trimmed.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic()
        || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}
