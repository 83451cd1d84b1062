// Command-line configuration for the `speedtest` binary.

use crate::registry::Endpoint;
use crate::speedtest::ControllerOptions;
use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use speedtest_common::LogFormat;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Run a network speed test from the command line.
#[derive(Parser, Debug)]
#[command(name = "speedtest", version, about = "Network speed test controller")]
pub struct Args {
    /// Worker setting as KEY=VALUE. VALUE is parsed as JSON, falling back to
    /// a plain string. Repeatable; the last value for a key wins.
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_setting)]
    pub settings: Vec<(String, Value)>,

    /// JSON file holding an array of endpoint descriptors.
    #[arg(long, value_name = "FILE")]
    pub servers: Option<PathBuf>,

    /// Use the named endpoint from --servers instead of probing for the
    /// fastest one.
    #[arg(long, value_name = "NAME", requires = "servers")]
    pub server: Option<String>,

    /// Run measurements in a separate worker process.
    #[arg(long)]
    pub isolated: bool,

    /// Worker binary for --isolated. Defaults to the one installed next to
    /// this executable.
    #[arg(long, value_name = "PATH", requires = "isolated")]
    pub worker: Option<PathBuf>,

    /// Interval between status polls, in milliseconds.
    #[arg(long, default_value_t = 200, value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_interval_ms: u64,

    /// Diagnostics format: text or json.
    #[arg(long, default_value = "text")]
    pub log_format: LogFormat,

    /// Print the final result as JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

impl Args {
    pub fn options(&self) -> ControllerOptions {
        ControllerOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// Parse `KEY=VALUE` into a settings entry.
pub fn parse_setting(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Read endpoint descriptors from a JSON file.
pub fn load_servers(path: &Path) -> Result<Vec<Endpoint>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read server list {:?}", path))?;
    let servers: Vec<Endpoint> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse server list {:?}", path))?;
    if servers.is_empty() {
        anyhow::bail!("Server list {:?} is empty", path);
    }
    Ok(servers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn setting_values_are_json_or_string() {
        assert_eq!(
            parse_setting("time_dl_max=5").unwrap(),
            ("time_dl_max".to_string(), json!(5))
        );
        assert_eq!(
            parse_setting("getIp_ispInfo=false").unwrap(),
            ("getIp_ispInfo".to_string(), json!(false))
        );
        assert_eq!(
            parse_setting("test_order=P_D").unwrap(),
            ("test_order".to_string(), json!("P_D"))
        );
        assert_eq!(
            parse_setting("url_dl=http://h/a?b=c").unwrap(),
            ("url_dl".to_string(), json!("http://h/a?b=c"))
        );
    }

    #[test]
    fn malformed_settings_are_rejected() {
        assert!(parse_setting("no_equals").is_err());
        assert!(parse_setting("=5").is_err());
    }

    #[test]
    fn args_parse_repeated_settings() {
        let args = Args::try_parse_from([
            "speedtest",
            "--set",
            "count_ping=3",
            "--set",
            "count_ping=7",
            "--poll-interval-ms",
            "50",
        ])
        .unwrap();
        assert_eq!(args.settings.len(), 2);
        assert_eq!(args.settings[1].1, json!(7));
        assert_eq!(args.options().poll_interval, Duration::from_millis(50));
        assert_eq!(args.log_format, LogFormat::Text);
        assert!(!args.isolated);
    }

    #[test]
    fn server_requires_server_list() {
        assert!(Args::try_parse_from(["speedtest", "--server", "Amsterdam"]).is_err());
        assert!(Args::try_parse_from(["speedtest", "--worker", "/bin/w"]).is_err());
        assert!(Args::try_parse_from(["speedtest", "--poll-interval-ms", "0"]).is_err());
    }

    #[test]
    fn server_list_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name":"local","server":"http://127.0.0.1:8989/"}},
               {{"name":"remote","server":"//st.example.net/","dlURL":"garbage"}}]"#
        )
        .unwrap();

        let servers = load_servers(file.path()).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].download_address(), "https://st.example.net/garbage");
    }

    #[test]
    fn empty_or_invalid_server_list_fails() {
        let mut empty = tempfile::NamedTempFile::new().unwrap();
        write!(empty, "[]").unwrap();
        assert!(load_servers(empty.path()).is_err());

        let mut invalid = tempfile::NamedTempFile::new().unwrap();
        write!(invalid, "{{not json").unwrap();
        let err = load_servers(invalid.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse server list"));
    }
}
