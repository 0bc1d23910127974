pub mod signaling;
pub mod state;
pub mod types;
