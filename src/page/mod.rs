pub mod classifier;
pub mod options;
pub mod scorer;
pub mod snapshot;
pub mod text;

// Re-export common types
pub use classifier::{PageClassification, PageClassifier, PageType, RecommendedAction};
pub use options::{common_route_options, extract_options, NavigationOption, TargetKind};
pub use scorer::{rank, NavigationScorer};
pub use snapshot::{NetworkResponse, PageSnapshot};
