#![allow(dead_code)]

pub mod builders;

pub use builders::{settings, CountingVerifier, GateBuilder, IdentityBuilder, TestGate, SECRET};
