//! Rules deriving the names of processed objects and status records
//! from the name of the source object.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// Matches the trailing extension of an object name.
static EXTENSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.([A-Za-z0-9_]+)$").expect("extension regex is valid"));

/// The suffix appended to the stem of a status record name.
const STATUS_SUFFIX: &str = "-status.json";

/// How processed objects are named after their source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingRule {
    /// `a.png` becomes `processed-a.png`.
    #[default]
    Prefix,
    /// `a.png` becomes `a-processed.png`.
    Suffix,
}

impl NamingRule {
    /// The key of the processed image.
    pub fn processed_key(&self, file_name: &str) -> String {
        match self {
            NamingRule::Prefix => format!("processed-{}", file_name),
            NamingRule::Suffix => {
                if EXTENSION_RE.is_match(file_name) {
                    EXTENSION_RE
                        .replace(file_name, "-processed.$1")
                        .into_owned()
                } else {
                    format!("{}-processed", file_name)
                }
            }
        }
    }

    /// The key of the status record. Always derived from the original
    /// file name, never from the processed key.
    pub fn status_key(&self, file_name: &str) -> String {
        format!("{}{}", EXTENSION_RE.replace(file_name, ""), STATUS_SUFFIX)
    }
}
