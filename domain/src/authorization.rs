//! Topic authorization.
//!
//! [`authorize`] is a pure function of the principal snapshot, the action, the
//! topic string and the optional entity reference carried by the request. Rules are
//! evaluated in order and the first match wins:
//!
//! 1. superusers may do anything;
//! 2. entity topics need `read_<type>` to subscribe and `update_<type>` to publish;
//! 3. `public.` topics may be subscribed to by anyone (publish falls through);
//! 4. `user.<own id>.` topics may be subscribed and published to by their owner;
//! 5. everything else is denied.

use crate::principal::Principal;
use crate::topic::{user_prefix, EntityRef, Topic, PUBLIC_PREFIX};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Subscribe,
    Publish,
}

impl Action {
    /// Privilege verb required on entity topics.
    fn privilege_verb(self) -> &'static str {
        match self {
            Action::Subscribe => "read",
            Action::Publish => "update",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Action::Subscribe => write!(f, "subscribe"),
            Action::Publish => write!(f, "publish"),
        }
    }
}

/// The rule that decided an authorization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Superuser,
    EntityPrivilege(String),
    EntityMismatch,
    PublicTopic,
    OwnUserTopic,
    NoMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(Rule),
    Deny(Rule),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    pub fn rule(&self) -> &Rule {
        match self {
            Decision::Allow(rule) | Decision::Deny(rule) => rule,
        }
    }
}

/// Privilege name guarding `action` on entities of `entity_type`, e.g. `read_order`.
pub fn entity_privilege(action: Action, entity_type: &str) -> String {
    format!("{}_{}", action.privilege_verb(), entity_type.to_lowercase())
}

pub fn authorize(
    principal: &Principal,
    action: Action,
    topic: &str,
    entity: Option<&EntityRef>,
) -> Decision {
    if principal.is_superuser {
        return Decision::Allow(Rule::Superuser);
    }

    let parsed = Topic::parse(topic);
    let topic_entity = parsed.entity_ref();

    // An explicit reference may only accompany the entity topic it names.
    if let Some(explicit) = entity {
        match topic_entity {
            Some(addressed) if explicit.same_entity(addressed) => {}
            _ => return Decision::Deny(Rule::EntityMismatch),
        }
    }

    if let Some(entity) = entity.or(topic_entity) {
        let privilege = entity_privilege(action, &entity.entity_type);
        return if principal.has_privilege(&privilege) {
            Decision::Allow(Rule::EntityPrivilege(privilege))
        } else {
            Decision::Deny(Rule::EntityPrivilege(privilege))
        };
    }

    if action == Action::Subscribe && topic.starts_with(PUBLIC_PREFIX) {
        return Decision::Allow(Rule::PublicTopic);
    }

    if topic.starts_with(&user_prefix(principal.id)) {
        return Decision::Allow(Rule::OwnUserTopic);
    }

    Decision::Deny(Rule::NoMatch)
}
