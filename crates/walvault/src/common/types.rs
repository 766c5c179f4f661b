//! Table identifiers shared across the crate.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A table OID as assigned by the upstream server.
///
/// Stable for the lifetime of a table, but reused across drop/recreate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Oid(pub u32);

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Oid {
    fn from(v: u32) -> Self {
        Oid(v)
    }
}

/// A schema-qualified table name.
///
/// May change over time for the same OID (rename) and may repeat across
/// OIDs (drop and recreate).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identifier-quoted form, safe to splice into DDL.
    pub fn sanitized(&self) -> String {
        format!(
            "\"{}\".\"{}\"",
            self.namespace.replace('"', "\"\""),
            self.name.replace('"', "\"\"")
        )
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

impl FromStr for NamespacedName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => {
                Ok(NamespacedName::new(ns, name))
            }
            _ => Err(format!("invalid qualified table name {s:?}")),
        }
    }
}

impl Serialize for NamespacedName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NamespacedName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        let n = NamespacedName::new("public", "users");
        assert_eq!(n.to_string(), "public.users");
        assert_eq!("public.users".parse::<NamespacedName>().unwrap(), n);
        // the table part keeps any further dots
        let odd = "public.a.b".parse::<NamespacedName>().unwrap();
        assert_eq!(odd.namespace, "public");
        assert_eq!(odd.name, "a.b");
        assert!("noschema".parse::<NamespacedName>().is_err());
    }

    #[test]
    fn sanitized_quotes_identifiers() {
        let n = NamespacedName::new("public", "weird\"name");
        assert_eq!(n.sanitized(), "\"public\".\"weird\"\"name\"");
    }

    #[test]
    fn oid_serializes_as_number() {
        let yaml = serde_yaml::to_string(&Oid(16384)).unwrap();
        assert_eq!(yaml.trim(), "16384");
    }
}
