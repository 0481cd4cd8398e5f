/// Event batcher with a sliding quiet window
pub mod event_batcher;

pub use event_batcher::{BatchHandler, EventBatcher};
