// speedtest-sdk: Foundation layer for the speedtest workspace.
// This crate has no dependencies on other speedtest crates and provides
// the tracing abstraction, build constants and URL helpers used throughout.

pub mod build_constants;
pub mod trace;
pub mod url_util;

// Re-export commonly used items at crate root
pub use build_constants::{SpeedtestPackage, Source};
pub use trace::{CollectingTraceWriter, NullTraceWriter, TraceLevel, TraceWriter, TracingTraceWriter};
pub use url_util::{UrlError, UrlUtil};
