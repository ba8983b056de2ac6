pub mod lease;
pub mod messages;

pub use lease::*;
pub use messages::*;
