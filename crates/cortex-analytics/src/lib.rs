pub mod recorder;
pub mod reports;

pub use recorder::{AnalyticsHandle, AnalyticsRecorder};
pub use reports::AnalyticsReports;
