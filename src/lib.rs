pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod loader;
pub mod sources;
pub mod target;
pub mod cache {
    pub mod disk;
    pub mod memory;
}
pub mod platform {
    pub mod memory;
}
pub mod processing {
    pub mod downsample;
    pub mod layout;
}
pub mod tasks {
    pub mod dispatcher;
    pub mod pipeline;
    pub mod scheduler;
}

pub use config::Configuration;
pub use error::LoadError;
pub use events::{DecodedImage, LoadOutcome, RequestKey, RequiredSize, SourceKind};
pub use loader::{ImageLoader, ImageLoaderBuilder, RequestStatus};
pub use processing::layout::ViewBounds;
pub use target::{ImageView, TargetHandle};
pub use tasks::dispatcher::{Completion, DeliveryPump};
