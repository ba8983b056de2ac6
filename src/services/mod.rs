pub mod lease_service;
pub mod tab_service;

pub use lease_service::*;
pub use tab_service::*;
