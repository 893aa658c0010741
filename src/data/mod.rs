pub mod fanout;
pub mod registry;

pub use fanout::Fanout;
pub use registry::{IdleTopicPolicy, Topic, TopicRegistry};
