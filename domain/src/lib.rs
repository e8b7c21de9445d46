//! Identity and access rules for the streaming service.
//!
//! Holds the principal snapshot handed over by the identity provider, the topic
//! namespaces and the pure authorization policy deciding who may subscribe or
//! publish where.

pub use uuid::Uuid as Id;

pub mod authorization;
pub mod error;
pub mod principal;
pub mod provider;
pub mod topic;

pub use authorization::{authorize, Action, Decision, Rule};
pub use principal::{Principal, Privilege, Role};
pub use provider::{PrincipalDirectory, PrincipalProvider};
pub use topic::{EntityRef, Topic};
