pub mod codec;
pub mod config;
pub mod messages;

pub use codec::*;
pub use config::*;
pub use messages::*;
