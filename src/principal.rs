//! Principals as supplied by the authentication boundary
//!
//! The engine never creates principals. It only checks that the string has a
//! known namespace prefix and a usable name.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::MAX_PART_LEN;
use crate::error::{CapError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrincipalKind {
    User,
    Service,
    Device,
    /// `anon:*`, the wildcard every caller implicitly is.
    Anonymous,
}

impl PrincipalKind {
    pub fn prefix(self) -> &'static str {
        match self {
            PrincipalKind::User => "user",
            PrincipalKind::Service => "service",
            PrincipalKind::Device => "device",
            PrincipalKind::Anonymous => "anon",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    kind: PrincipalKind,
    name: String,
}

impl Principal {
    pub fn user(name: impl Into<String>) -> Result<Self> {
        Self::new(PrincipalKind::User, name)
    }

    pub fn service(name: impl Into<String>) -> Result<Self> {
        Self::new(PrincipalKind::Service, name)
    }

    pub fn device(name: impl Into<String>) -> Result<Self> {
        Self::new(PrincipalKind::Device, name)
    }

    pub fn anonymous() -> Self {
        Principal { kind: PrincipalKind::Anonymous, name: "*".into() }
    }

    pub fn new(kind: PrincipalKind, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if kind == PrincipalKind::Anonymous {
            return if name == "*" {
                Ok(Self::anonymous())
            } else {
                Err(CapError::Validation(format!("anonymous principal must be 'anon:*', got 'anon:{}'", name)))
            };
        }
        if name.is_empty() || name == "*" {
            return Err(CapError::Validation(format!("invalid {} principal name '{}'", kind.prefix(), name)));
        }
        if name.len() + kind.prefix().len() + 1 > MAX_PART_LEN || name.chars().any(char::is_control) {
            return Err(CapError::Validation(format!("invalid {} principal name", kind.prefix())));
        }
        Ok(Principal { kind, name })
    }

    pub fn kind(&self) -> PrincipalKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_anonymous(&self) -> bool {
        self.kind == PrincipalKind::Anonymous
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.name)
    }
}

impl FromStr for Principal {
    type Err = CapError;

    fn from_str(s: &str) -> Result<Self> {
        let (prefix, name) = s
            .split_once(':')
            .ok_or_else(|| CapError::Validation(format!("principal '{}' has no namespace prefix", s)))?;
        let kind = match prefix {
            "user" => PrincipalKind::User,
            "service" => PrincipalKind::Service,
            "device" => PrincipalKind::Device,
            "anon" => PrincipalKind::Anonymous,
            other => return Err(CapError::Validation(format!("unknown principal namespace '{}'", other))),
        };
        Principal::new(kind, name)
    }
}

impl Serialize for Principal {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Principal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_namespaces() {
        let p: Principal = "user:alice".parse().unwrap();
        assert_eq!(p.kind(), PrincipalKind::User);
        assert_eq!(p.name(), "alice");
        assert_eq!(p.to_string(), "user:alice");
        assert_eq!("service:billing".parse::<Principal>().unwrap().kind(), PrincipalKind::Service);
        assert!("anon:*".parse::<Principal>().unwrap().is_anonymous());
    }

    #[test]
    fn names_may_contain_colons() {
        let p: Principal = "device:aa:bb:cc".parse().unwrap();
        assert_eq!(p.name(), "aa:bb:cc");
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["alice", "robot:x", "user:", "user:*", "anon:bob", ""] {
            assert!(matches!(bad.parse::<Principal>(), Err(CapError::Validation(_))), "{}", bad);
        }
    }
}
