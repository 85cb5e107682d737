//! Routing Module
//!
//! Destination resolution and access control.

pub mod acl;
pub mod resolver;
pub mod router;
pub mod rules;
pub mod types;

pub use acl::{AclRuleSet, AccessControlRule, Pattern};
pub use resolver::{DnsResolver, Resolver};
pub use router::Router;
pub use rules::{AllOf, PermitAll, PermitCommand, RuleSet};
pub use types::*;
