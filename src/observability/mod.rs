pub mod logging;
pub mod metrics;

pub use logging::{LogFormat, init_logging};
pub use metrics::{MetricsRegistry, init_metrics};
