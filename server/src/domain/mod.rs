//! Domain models

pub mod descriptor;
pub mod identity;
pub mod session;
