//! Resource addressing
//!
//! Canonical form is `kind:namespace[:id[:field]]`. An absent id and the id
//! `*` both mean "every instance in the namespace". Wildcards are one-way:
//! a wildcard capability covers a concrete request, never the reverse.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::MAX_PART_LEN;
use crate::error::{CapError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Api,
    Data,
    System,
    Group,
    Global,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Api => "api",
            ResourceKind::Data => "data",
            ResourceKind::System => "system",
            ResourceKind::Group => "group",
            ResourceKind::Global => "admin",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "api" | "api-endpoint" => ResourceKind::Api,
            "data" | "data-row" => ResourceKind::Data,
            "system" | "system-capability" => ResourceKind::System,
            "group" | "capability-group" => ResourceKind::Group,
            "admin" => ResourceKind::Global,
            "" => return Err(CapError::Validation("resource kind is empty".into())),
            other => return Err(CapError::Validation(format!("unknown resource kind '{}'", other))),
        })
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespace-scoped address shared by the api, data and system kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub namespace: String,
    /// `None` means every instance.
    pub id: Option<String>,
    /// Reserved for field-level scoping; carried but not enforced.
    pub field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Api(Scope),
    Data(Scope),
    System(Scope),
    /// A capability group, addressed by name.
    Group { name: String },
    /// `admin:*`, which covers every resource.
    Global,
}

/// How a capability's resource covers a requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Coverage {
    Wildcard,
    Exact,
}

impl Resource {
    pub fn api(namespace: &str, id: Option<&str>) -> Result<Self> {
        Ok(Resource::Api(Scope::new(namespace, id, None)?))
    }

    pub fn data(namespace: &str, id: Option<&str>) -> Result<Self> {
        Ok(Resource::Data(Scope::new(namespace, id, None)?))
    }

    pub fn system(namespace: &str, id: Option<&str>) -> Result<Self> {
        Ok(Resource::System(Scope::new(namespace, id, None)?))
    }

    pub fn group(name: &str) -> Result<Self> {
        check_part("group name", name)?;
        Ok(Resource::Group { name: name.to_string() })
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Api(_) => ResourceKind::Api,
            Resource::Data(_) => ResourceKind::Data,
            Resource::System(_) => ResourceKind::System,
            Resource::Group { .. } => ResourceKind::Group,
            Resource::Global => ResourceKind::Global,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Resource::Api(s) | Resource::Data(s) | Resource::System(s) => &s.namespace,
            Resource::Group { name } => name,
            Resource::Global => "*",
        }
    }

    /// Concrete instance id, or `None` for "every instance".
    pub fn id(&self) -> Option<&str> {
        match self {
            Resource::Api(s) | Resource::Data(s) | Resource::System(s) => s.id.as_deref(),
            Resource::Group { .. } | Resource::Global => None,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        match self {
            Resource::Api(s) | Resource::Data(s) | Resource::System(s) => s.id.is_none(),
            Resource::Group { .. } => false,
            Resource::Global => true,
        }
    }

    /// Does a capability scoped to `self` cover a request for `requested`?
    pub fn covers(&self, requested: &Resource) -> Option<Coverage> {
        match (self, requested) {
            (Resource::Global, Resource::Global) => Some(Coverage::Exact),
            (Resource::Global, _) => Some(Coverage::Wildcard),
            (Resource::Group { name: a }, Resource::Group { name: b }) => (a == b).then_some(Coverage::Exact),
            (Resource::Api(held), Resource::Api(req))
            | (Resource::Data(held), Resource::Data(req))
            | (Resource::System(held), Resource::System(req)) => held.covers(req),
            _ => None,
        }
    }

    /// Key parts used by the resource index: kind, namespace, id-or-`*`.
    pub(crate) fn index_parts(&self) -> [&str; 3] {
        [self.kind().as_str(), self.namespace(), self.id().unwrap_or("*")]
    }
}

impl Scope {
    pub fn new(namespace: &str, id: Option<&str>, field: Option<&str>) -> Result<Self> {
        check_part("namespace", namespace)?;
        if namespace == "*" {
            return Err(CapError::Validation("namespace cannot be a wildcard".into()));
        }
        let id = match id {
            None | Some("*") => None,
            Some(id) => {
                check_part("id", id)?;
                Some(id.to_string())
            }
        };
        if let Some(f) = field {
            check_part("field", f)?;
        }
        Ok(Scope { namespace: namespace.to_string(), id, field: field.map(str::to_string) })
    }

    fn covers(&self, req: &Scope) -> Option<Coverage> {
        if self.namespace != req.namespace {
            return None;
        }
        match (&self.id, &req.id) {
            (None, _) => Some(Coverage::Wildcard),
            (Some(held), Some(want)) if held == want => Some(Coverage::Exact),
            _ => None,
        }
    }
}

fn check_part(what: &str, s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(CapError::Validation(format!("resource {} is empty", what)));
    }
    if s.len() > MAX_PART_LEN || s.contains(':') || s.chars().any(char::is_control) {
        return Err(CapError::Validation(format!("invalid resource {} '{}'", what, s)));
    }
    Ok(())
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Api(s) | Resource::Data(s) | Resource::System(s) => {
                write!(f, "{}:{}", self.kind(), s.namespace)?;
                match (&s.id, &s.field) {
                    (Some(id), Some(field)) => write!(f, ":{}:{}", id, field),
                    (None, Some(field)) => write!(f, ":*:{}", field),
                    (Some(id), None) => write!(f, ":{}", id),
                    (None, None) => Ok(()),
                }
            }
            Resource::Group { name } => write!(f, "group:{}", name),
            Resource::Global => f.write_str("admin:*"),
        }
    }
}

impl FromStr for Resource {
    type Err = CapError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 2 {
            return Err(CapError::Validation(format!("resource '{}' is missing kind or namespace", s)));
        }
        if parts.len() > 4 {
            return Err(CapError::Validation(format!("resource '{}' has too many segments", s)));
        }
        match ResourceKind::parse(parts[0])? {
            ResourceKind::Global if parts[1..] == ["*"] => Ok(Resource::Global),
            ResourceKind::Global => Err(CapError::Validation(format!("admin resource must be 'admin:*', got '{}'", s))),
            ResourceKind::Group => match parts[1..] {
                [name] | [name, "*"] => Resource::group(name),
                _ => Err(CapError::Validation(format!("group resource '{}' takes only a name", s))),
            },
            kind => {
                let scope = Scope::new(parts[1], parts.get(2).copied(), parts.get(3).copied())?;
                Ok(match kind {
                    ResourceKind::Api => Resource::Api(scope),
                    ResourceKind::Data => Resource::Data(scope),
                    _ => Resource::System(scope),
                })
            }
        }
    }
}

impl Serialize for Resource {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Resource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(s: &str) -> Resource {
        s.parse().unwrap()
    }

    #[test]
    fn canonical_round_trip() {
        for s in ["data:projects", "data:projects:123", "api:voice:session:duration", "group:explorer-tier", "admin:*"] {
            assert_eq!(r(s).to_string(), s);
        }
        assert_eq!(r("data:projects:*").to_string(), "data:projects");
        assert_eq!(r("data-row:projects:7").to_string(), "data:projects:7");
        assert_eq!(r("capability-group:beta").kind(), ResourceKind::Group);
    }

    #[test]
    fn malformed_addresses_rejected() {
        for bad in ["", "data", ":projects", "data:", "blob:projects", "data:*", "admin:projects", "group:a:b", "data:a:b:c:d"] {
            assert!(matches!(bad.parse::<Resource>(), Err(CapError::Validation(_))), "{}", bad);
        }
    }

    #[test]
    fn wildcard_is_one_way() {
        let any = r("data:project:*");
        let one = r("data:project:123");
        assert_eq!(any.covers(&one), Some(Coverage::Wildcard));
        assert_eq!(any.covers(&any), Some(Coverage::Wildcard));
        assert_eq!(one.covers(&one), Some(Coverage::Exact));
        assert_eq!(one.covers(&any), None);
        assert_eq!(one.covers(&r("data:project:456")), None);
    }

    #[test]
    fn kind_and_namespace_must_match() {
        assert_eq!(r("data:project").covers(&r("api:project:1")), None);
        assert_eq!(r("data:project").covers(&r("data:tasks:1")), None);
        assert_eq!(r("group:a").covers(&r("group:b")), None);
    }

    #[test]
    fn global_covers_everything() {
        for s in ["data:project:1", "api:voice", "system:billing", "group:beta"] {
            assert_eq!(Resource::Global.covers(&r(s)), Some(Coverage::Wildcard));
        }
        assert_eq!(r("data:project").covers(&Resource::Global), None);
    }

    #[test]
    fn field_is_not_enforced() {
        assert_eq!(r("data:project:1:title").covers(&r("data:project:1:owner")), Some(Coverage::Exact));
    }
}
