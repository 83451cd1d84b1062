//! Build constants for the speedtest package, taken from compile-time
//! environment variables with fallbacks.

/// Source control information.
pub struct Source;

impl Source {
    /// The commit hash from which this binary was built.
    /// Set via the `SPEEDTEST_COMMIT_HASH` env var at compile time, or "N/A".
    pub const COMMIT_HASH: &'static str = match option_env!("SPEEDTEST_COMMIT_HASH") {
        Some(h) => h,
        None => "N/A",
    };
}

/// Package metadata.
#[derive(Debug, Clone)]
pub struct SpeedtestPackage;

impl SpeedtestPackage {
    /// Semantic version, from `CARGO_PKG_VERSION`.
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    /// Distribution name shown in the startup banner.
    pub const PACKAGE_NAME: &'static str = match option_env!("SPEEDTEST_PACKAGE_NAME") {
        Some(n) => n,
        None => "speedtest",
    };

    /// One-line banner logged when a binary starts.
    pub fn banner() -> String {
        format!(
            "{} v{} (commit {})",
            Self::PACKAGE_NAME,
            Self::VERSION,
            Source::COMMIT_HASH
        )
    }
}
