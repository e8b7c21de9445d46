//! Topic naming.
//!
//! Three namespaces exist on the wire and their prefixes must be reproduced
//! exactly: `public.<suffix>`, `user.<principal-id>.<suffix>` and
//! `entity.<lowercased-type>.<entity-id>`.

use crate::Id;
use std::fmt;

pub const PUBLIC_PREFIX: &str = "public.";
pub const USER_PREFIX: &str = "user.";
pub const ENTITY_PREFIX: &str = "entity.";

pub fn public_topic(suffix: &str) -> String {
    format!("{PUBLIC_PREFIX}{suffix}")
}

pub fn user_topic(principal_id: Id, suffix: &str) -> String {
    format!("{USER_PREFIX}{principal_id}.{suffix}")
}

/// `entity.<lowercased type>.<id>`
pub fn entity_topic(entity_type: &str, entity_id: Id) -> String {
    format!("{ENTITY_PREFIX}{}.{entity_id}", entity_type.to_lowercase())
}

/// The prefix every topic owned by `principal_id` starts with.
pub fn user_prefix(principal_id: Id) -> String {
    format!("{USER_PREFIX}{principal_id}.")
}

/// A reference to a single entity: its type name and id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: Id,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: Id) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
        }
    }

    /// The entity type as it appears in topics and privilege names.
    pub fn normalized_type(&self) -> String {
        self.entity_type.to_lowercase()
    }

    pub fn topic(&self) -> String {
        entity_topic(&self.entity_type, self.entity_id)
    }

    /// Whether this reference names the same entity as `other`, ignoring type case.
    pub fn same_entity(&self, other: &EntityRef) -> bool {
        self.entity_id == other.entity_id && self.normalized_type() == other.normalized_type()
    }
}

/// A topic string classified by namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Public { suffix: String },
    User { principal_id: Id, suffix: String },
    Entity(EntityRef),
    /// Anything that does not parse into one of the namespaces above.
    Other(String),
}

impl Topic {
    pub fn parse(topic: &str) -> Self {
        if let Some(suffix) = topic.strip_prefix(PUBLIC_PREFIX) {
            if !suffix.is_empty() {
                return Topic::Public {
                    suffix: suffix.to_string(),
                };
            }
        }

        if let Some(rest) = topic.strip_prefix(USER_PREFIX) {
            if let Some((id, suffix)) = rest.split_once('.') {
                if let Ok(principal_id) = Id::parse_str(id) {
                    return Topic::User {
                        principal_id,
                        suffix: suffix.to_string(),
                    };
                }
            }
        }

        if let Some(rest) = topic.strip_prefix(ENTITY_PREFIX) {
            if let Some((entity_type, id)) = rest.split_once('.') {
                if !entity_type.is_empty() {
                    if let Ok(entity_id) = Id::parse_str(id) {
                        return Topic::Entity(EntityRef::new(entity_type, entity_id));
                    }
                }
            }
        }

        Topic::Other(topic.to_string())
    }

    pub fn entity_ref(&self) -> Option<&EntityRef> {
        match self {
            Topic::Entity(entity) => Some(entity),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Topic::Public { suffix } => write!(f, "{}", public_topic(suffix)),
            Topic::User {
                principal_id,
                suffix,
            } => write!(f, "{}", user_topic(*principal_id, suffix)),
            Topic::Entity(entity) => write!(f, "{}", entity.topic()),
            Topic::Other(raw) => write!(f, "{raw}"),
        }
    }
}
