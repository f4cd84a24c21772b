//! Actions and action sets
//!
//! An `ActionSet` is a bitmask, so duplicates collapse by construction and
//! membership is a single AND.

use std::fmt;
use std::str::FromStr;

use serde::de::{Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

use crate::constants::{ADMIN, ALL_ACTIONS, CREATE, DELEGATE, DELETE, READ, UPDATE, WRITE};
use crate::error::{CapError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    Create,
    Update,
    Delete,
    Admin,
    Delegate,
}

const ACTIONS: &[(Action, &str, u8)] = &[
    (Action::Read, "read", READ),
    (Action::Write, "write", WRITE),
    (Action::Create, "create", CREATE),
    (Action::Update, "update", UPDATE),
    (Action::Delete, "delete", DELETE),
    (Action::Admin, "admin", ADMIN),
    (Action::Delegate, "delegate", DELEGATE),
];

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Read,
        Action::Write,
        Action::Create,
        Action::Update,
        Action::Delete,
        Action::Admin,
        Action::Delegate,
    ];

    #[inline]
    pub fn bit(self) -> u8 {
        ACTIONS.iter().find(|(a, _, _)| *a == self).map(|(_, _, b)| *b).unwrap_or(0)
    }

    pub fn as_str(self) -> &'static str {
        ACTIONS.iter().find(|(a, _, _)| *a == self).map(|(_, n, _)| *n).unwrap_or("")
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = CapError;

    fn from_str(s: &str) -> Result<Self> {
        ACTIONS
            .iter()
            .find(|(_, n, _)| *n == s)
            .map(|(a, _, _)| *a)
            .ok_or_else(|| CapError::Validation(format!("unknown action '{}'", s)))
    }
}

/// A set of actions stored as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ActionSet(u8);

impl ActionSet {
    pub const fn empty() -> Self {
        ActionSet(0)
    }

    pub const fn all() -> Self {
        ActionSet(ALL_ACTIONS)
    }

    pub fn from_bits(bits: u8) -> Self {
        ActionSet(bits & ALL_ACTIONS)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, action: Action) -> bool {
        self.0 & action.bit() != 0
    }

    pub fn insert(&mut self, action: Action) {
        self.0 |= action.bit();
    }

    pub fn with(mut self, action: Action) -> Self {
        self.insert(action);
        self
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = Action> {
        Action::ALL.into_iter().filter(move |a| self.contains(*a))
    }

    /// Parse action names, rejecting unknown names.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        names
            .iter()
            .map(|n| n.as_ref().parse::<Action>())
            .try_fold(ActionSet::empty(), |set, a| Ok(set.with(a?)))
    }

    pub fn names(self) -> Vec<&'static str> {
        self.iter().map(Action::as_str).collect()
    }
}

impl FromIterator<Action> for ActionSet {
    fn from_iter<I: IntoIterator<Item = Action>>(iter: I) -> Self {
        iter.into_iter().fold(ActionSet::empty(), ActionSet::with)
    }
}

impl<const N: usize> From<[Action; N]> for ActionSet {
    fn from(actions: [Action; N]) -> Self {
        actions.into_iter().collect()
    }
}

impl From<Action> for ActionSet {
    fn from(action: Action) -> Self {
        ActionSet::empty().with(action)
    }
}

impl fmt::Display for ActionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join(","))
    }
}

// Serialized as a list of action names so stored rows stay readable.
impl Serialize for ActionSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for action in self.iter() {
            seq.serialize_element(&action)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for ActionSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SetVisitor;

        impl<'de> Visitor<'de> for SetVisitor {
            type Value = ActionSet;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list of action names")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<ActionSet, A::Error> {
                let mut set = ActionSet::empty();
                while let Some(action) = seq.next_element::<Action>()? {
                    set.insert(action);
                }
                Ok(set)
            }
        }

        deserializer.deserialize_seq(SetVisitor)
    }
}
