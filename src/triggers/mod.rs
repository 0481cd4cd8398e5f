/// Event classifier and rule implementations
pub mod classifier;
pub mod rules;

pub use classifier::{classify, EventClassifier};
pub use rules::{contains_failure, TriggerRule};
