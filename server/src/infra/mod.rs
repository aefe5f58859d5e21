//! Infrastructure layer

pub mod exec;
pub mod kube;
pub mod session_registry;
