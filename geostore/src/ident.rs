//! Validated SQL identifiers.
//!
//! Source names and schema names end up inside generated SQL and on the
//! converter's command line. They are checked once, when the configuration is
//! loaded, and from then on travel as [`Identifier`] values that the helpers
//! below can quote without looking at them again.

use crate::errors::{Result, StorageError};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// A name made only of ASCII letters, digits and underscores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if is_valid(&raw) {
            Ok(Self(raw))
        } else {
            Err(StorageError::InvalidIdentifier(raw))
        }
    }

    /// Builds an identifier from a literal known to be valid.
    pub(crate) fn trusted(raw: &str) -> Self {
        debug_assert!(is_valid(raw), "{raw:?} is not a valid identifier");
        Self(raw.to_string())
    }

    /// Appends a fixed suffix such as `_order`.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        debug_assert!(suffix.chars().all(is_identifier_char));
        Self(format!("{}{}", self.0, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased copy, the name an unquoted identifier folds to in
    /// PostgreSQL and the name ogr2ogr launders a layer to.
    pub fn folded(&self) -> Self {
        Self(self.0.to_ascii_lowercase())
    }

    /// Double-quoted form for use in SQL text.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_valid(raw: &str) -> bool {
    !raw.is_empty() && raw.chars().all(is_identifier_char)
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Identifier {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Identifier::parse(raw).map_err(serde::de::Error::custom)
    }
}

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedTable {
    pub schema: Identifier,
    pub table: Identifier,
}

impl QualifiedTable {
    pub fn new(schema: &Identifier, table: &Identifier) -> Self {
        Self {
            schema: schema.clone(),
            table: table.clone(),
        }
    }

    /// The table holding a source's data. Source names are folded to
    /// lowercase so the SQL side and the converter agree on the table.
    pub fn for_source(schema: &Identifier, source: &Identifier) -> Self {
        Self {
            schema: schema.clone(),
            table: source.folded(),
        }
    }

    /// `schema.table` without quotes, as external tools expect it.
    pub fn dotted(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Renders as `"schema"."table"`.
impl fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema.quoted(), self.table.quoted())
    }
}
