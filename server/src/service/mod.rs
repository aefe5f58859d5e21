//! Service layer

pub mod bridge;
pub mod injector;
pub mod provisioner;
pub mod terminal;
