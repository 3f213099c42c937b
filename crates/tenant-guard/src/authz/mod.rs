//! Authorization guard.
//!
//! [`decide`] and [`decide_operation`] are pure functions of a user's
//! memberships. The [`OperationPolicy`] maps operation names to the role
//! they require and is loaded from configuration.

mod decision;
mod policy;

pub use decision::{Decision, DenyReason, Grant, decide, decide_operation, highest_role};
pub use policy::{OperationPolicy, operations};
