//! Sandboxed container lifecycle: mount planning, mount security, secret
//! delivery and the async runner.

pub mod mounts;
pub mod runner;
pub mod secrets;
pub mod security;
