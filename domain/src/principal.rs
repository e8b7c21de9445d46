use crate::Id;
use serde::{Deserialize, Serialize};

/// A named permission string such as `read_order`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Privilege {
    pub name: String,
}

impl Privilege {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Role {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub privileges: Vec<Privilege>,
}

impl Role {
    pub fn new(name: impl Into<String>, privileges: &[&str]) -> Self {
        Self {
            name: name.into(),
            privileges: privileges.iter().copied().map(Privilege::new).collect(),
        }
    }
}

/// An already-authenticated identity and its resolved privileges.
///
/// Supplied by the identity provider when a connection opens and treated as a
/// snapshot: it is never refreshed for the lifetime of that connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Principal {
    pub id: Id,
    pub username: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default)]
    pub roles: Vec<Role>,
}

fn default_active() -> bool {
    true
}

impl Principal {
    pub fn new(id: Id, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            is_active: true,
            is_superuser: false,
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.push(role);
        self
    }

    pub fn superuser(mut self) -> Self {
        self.is_superuser = true;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Exact-match scan of every role's privilege names.
    pub fn has_privilege(&self, name: &str) -> bool {
        self.roles
            .iter()
            .flat_map(|role| role.privileges.iter())
            .any(|privilege| privilege.name == name)
    }
}
