pub mod actions;
pub mod frames;

pub use frames::{ClientMessage, ServerMessage};
