//! Record model, fingerprinting, diffing and message formatting for Insider Watch.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "inwatch-core";

/// Column that every record must carry to be rendered as a notification.
pub const TICKER_COLUMN: &str = "Ticker";

/// Reference pages appended to every notification; `{ticker}` is substituted.
pub const REFERENCE_LINK_TEMPLATES: [&str; 3] = [
    "https://www.openinsider.com/{ticker}",
    "https://finance.yahoo.com/quote/{ticker}",
    "https://finviz.com/quote.ashx?t={ticker}",
];

const FIELD_SEPARATOR: u8 = 0x1f;

/// One scraped table row: column name to cell text, in column order.
///
/// Serializes as a flat JSON object whose key order is the column order, which is
/// the line format of the dataset store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(IndexMap<String, String>);

impl Record {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        FingerprintScheme::default().fingerprint(self)
    }
}

/// Ordered sequence of records, either freshly scraped or read back from the store.
pub type Dataset = Vec<Record>;

/// SHA-256 digest identifying a record by its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// How record values are joined before hashing.
///
/// `Concatenated` joins values with nothing in between, so `["12", "3"]` and
/// `["1", "23"]` share a fingerprint. `Delimited` terminates every value with an
/// ASCII unit separator and has no such collisions. Both sides of a diff are
/// always hashed with the same scheme, so switching leaves the store readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FingerprintScheme {
    #[default]
    Concatenated,
    Delimited,
}

impl FingerprintScheme {
    pub fn fingerprint(self, record: &Record) -> Fingerprint {
        let mut hasher = Sha256::new();
        for value in record.values() {
            hasher.update(value.as_bytes());
            if self == Self::Delimited {
                hasher.update([FIELD_SEPARATOR]);
            }
        }
        Fingerprint(hasher.finalize().into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown fingerprint scheme `{0}` (expected `concatenated` or `delimited`)")]
pub struct ParseSchemeError(String);

impl FromStr for FingerprintScheme {
    type Err = ParseSchemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concatenated" | "legacy" => Ok(Self::Concatenated),
            "delimited" => Ok(Self::Delimited),
            other => Err(ParseSchemeError(other.to_string())),
        }
    }
}

/// Records of `scraped` whose fingerprint does not occur in `stored`, in scraped order.
pub fn new_additions(scraped: &[Record], stored: &[Record]) -> Dataset {
    new_additions_with(FingerprintScheme::default(), scraped, stored)
}

pub fn new_additions_with(
    scheme: FingerprintScheme,
    scraped: &[Record],
    stored: &[Record],
) -> Dataset {
    if stored.is_empty() {
        return scraped.to_vec();
    }

    let known: HashSet<Fingerprint> = stored.iter().map(|r| scheme.fingerprint(r)).collect();
    scraped
        .iter()
        .filter(|r| !known.contains(&scheme.fingerprint(r)))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("record has no `{field}` value")]
    MissingField { field: &'static str },
}

/// Renders a record as a chat message: one `column: value` line per field, a blank
/// line, then one reference link per line for the record's ticker.
///
/// The ticker is substituted into the links exactly as stored, even when empty.
pub fn format_message(record: &Record) -> Result<String, FormatError> {
    let ticker = record
        .get(TICKER_COLUMN)
        .ok_or(FormatError::MissingField {
            field: TICKER_COLUMN,
        })?;

    let mut msg = record
        .iter()
        .map(|(col, val)| format!("{col}: {val}"))
        .collect::<Vec<_>>()
        .join("\n");

    msg.push_str("\n\n");
    for template in REFERENCE_LINK_TEMPLATES {
        msg.push_str(&template.replace("{ticker}", ticker));
        msg.push('\n');
    }
    Ok(msg)
}
