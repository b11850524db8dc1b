//! Rolegate - role-to-route access gate
//!
//! Compiles role → page edges authored in a graph editor into an immutable
//! access table and evaluates every inbound request against it.

pub mod audit;
pub mod credential;
pub mod discovery;
pub mod errors;
pub mod evaluator;
pub mod policy;
pub mod settings;
pub mod web;
