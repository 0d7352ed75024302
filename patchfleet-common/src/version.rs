//! Ordering for baseline version labels.

use regex::Regex;
use std::cmp::Ordering;
use std::sync::LazyLock;

static DIGITS_AFTER_TEXT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([^.0-9])(\d+)").ok());

/// One dot-separated piece of a version label.
///
/// Text sorts before numbers, so `9.3.rc0` (`[9, 3, "rc", 0, "z"]`) sorts
/// before `9.3` (`[9, 3, "z"]`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionPart {
    Text(String),
    Num(u64),
}

/// Totally ordered key for a version label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionKey(Vec<VersionPart>);

/// Convert a version label into a comparable key.
pub fn comparable_version(label: &str) -> VersionKey {
    let spaced = match DIGITS_AFTER_TEXT.as_ref() {
        Some(re) => re.replace_all(label, "$1.$2").into_owned(),
        None => label.to_string(),
    };
    let parts = format!("{spaced}.z")
        .split('.')
        .map(|piece| match piece.parse::<u64>() {
            Ok(n) => VersionPart::Num(n),
            Err(_) => VersionPart::Text(piece.to_string()),
        })
        .collect();
    VersionKey(parts)
}

/// Compare two labels by [`comparable_version`].
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    comparable_version(a).cmp(&comparable_version(b))
}

/// The greatest label in `labels`, if any.
pub fn latest_version<'a, I>(labels: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    labels.into_iter().max_by(|a, b| compare_versions(a, b))
}
