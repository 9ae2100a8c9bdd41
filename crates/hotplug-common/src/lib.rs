#![doc = "Common types shared across the hot-plug validator workspace."]

pub mod clock;
pub mod config;
pub mod error;
pub mod resource;
pub mod state;
pub mod wait;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use resource::*;
pub use state::*;
pub use wait::*;
