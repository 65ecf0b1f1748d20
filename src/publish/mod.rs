pub mod publisher;

pub use publisher::{
    run_publisher, BatchPublisher, PublishError, PublishMetrics, PulsarPublisher,
};
