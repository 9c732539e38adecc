/*!
 * Serde utilities for common serialization/deserialization patterns.
 *
 * Job definitions come from hand-written files, so a few fields accept more than one
 * representation. These helpers normalise them at the deserialization boundary.
 */

use serde::{Deserialize, Deserializer};

/// Deserialize a list of names that may be written as a sequence or as a single
/// comma-separated string.
///
/// ```toml
/// depends_on = ["crawl", "index"]   # sequence
/// depends_on = "crawl, index"       # comma-separated string
/// ```
///
/// Empty entries are dropped and surrounding whitespace is trimmed.
///
/// # Usage with serde
///
/// ```rust
/// use serde::Deserialize;
/// use jobtree_core::utils::serde::deserialize_string_list;
///
/// #[derive(Deserialize)]
/// struct StepRef {
///     #[serde(default, deserialize_with = "deserialize_string_list")]
///     depends_on: Vec<String>,
/// }
///
/// let parsed: StepRef = serde_json::from_str(r#"{"depends_on": "a, b"}"#).unwrap();
/// assert_eq!(parsed.depends_on, vec!["a".to_string(), "b".to_string()]);
/// ```
pub fn deserialize_string_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        Single(String),
        List(Vec<String>),
    }

    let raw: Option<StringOrList> = Option::deserialize(deserializer)?;
    let items = match raw {
        None => Vec::new(),
        Some(StringOrList::Single(s)) => s.split(',').map(str::to_string).collect(),
        Some(StringOrList::List(list)) => list,
    };

    Ok(items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect())
}
