pub mod api;
pub mod events;
pub mod models;
pub mod topic;

pub use models::PeerId;
pub use topic::{Topic, TopicError, TopicKind};
