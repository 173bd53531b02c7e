mod logging;
mod metrics;

pub use logging::{init_logging, LoggingConfig};
pub use metrics::{HistogramSummary, MetricsRecorder, MetricsSnapshot};
