//! Training callbacks for monitoring and controlling training.

pub mod core;
pub mod early_stopping;
pub mod progress;

// Re-export core types
pub use self::core::{Callback, CallbackList, EpochCallback};

// Re-export early stopping types
pub use early_stopping::EarlyStoppingCallback;

// Re-export progress types
pub use progress::{ProgressCallback, ProgressFn};
