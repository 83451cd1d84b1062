use thiserror::Error;
use url::Url;

/// Scheme used for protocol-relative server bases (`//host/`).
pub const DEFAULT_SCHEME: &str = "https:";

/// Why an address is not usable for measurement requests.
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("invalid URL '{url}': {source}")]
    Invalid {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported scheme '{scheme}' in '{url}'")]
    UnsupportedScheme { scheme: String, url: String },
}

/// URL helpers for building measurement endpoint addresses.
pub struct UrlUtil;

impl UrlUtil {
    /// Join a server base and a relative endpoint path.
    ///
    /// Server bases are usually written with a trailing slash
    /// (`http://host/`), in which case the path is appended verbatim.
    /// A protocol-relative base gets [`DEFAULT_SCHEME`]. A path that is
    /// already absolute (`http://...`) is returned unchanged.
    pub fn join_endpoint(server: &str, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }

        let base = if server.starts_with("//") {
            format!("{DEFAULT_SCHEME}{server}")
        } else {
            server.to_string()
        };

        match (base.ends_with('/'), path.starts_with('/')) {
            (true, true) => format!("{}{}", base, &path[1..]),
            (false, false) if !base.is_empty() && !path.is_empty() => format!("{base}/{path}"),
            _ => format!("{base}{path}"),
        }
    }

    /// Append a query parameter, choosing `?` or `&` as needed.
    pub fn append_query(url: &str, key: &str, value: &str) -> String {
        let sep = if url.contains('?') { '&' } else { '?' };
        format!("{url}{sep}{key}={value}")
    }

    /// Parse an absolute http(s) URL.
    pub fn parse_http(url: &str) -> Result<Url, UrlError> {
        let parsed = Url::parse(url).map_err(|source| UrlError::Invalid {
            url: url.to_string(),
            source,
        })?;
        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            other => Err(UrlError::UnsupportedScheme {
                scheme: other.to_string(),
                url: url.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_with_trailing_slash() {
        assert_eq!(
            UrlUtil::join_endpoint("http://a.example/", "garbage.php"),
            "http://a.example/garbage.php"
        );
        assert_eq!(
            UrlUtil::join_endpoint("http://a.example/", "/empty.php"),
            "http://a.example/empty.php"
        );
    }

    #[test]
    fn join_inserts_missing_slash() {
        assert_eq!(
            UrlUtil::join_endpoint("http://a.example/backend", "getIP.php"),
            "http://a.example/backend/getIP.php"
        );
    }

    #[test]
    fn protocol_relative_base_gets_https() {
        assert_eq!(
            UrlUtil::join_endpoint("//b.example/", "empty.php"),
            "https://b.example/empty.php"
        );
    }

    #[test]
    fn absolute_path_wins() {
        assert_eq!(
            UrlUtil::join_endpoint("http://a.example/", "https://c.example/x"),
            "https://c.example/x"
        );
    }

    #[test]
    fn append_query_picks_separator() {
        assert_eq!(UrlUtil::append_query("http://h/e", "r", "1"), "http://h/e?r=1");
        assert_eq!(
            UrlUtil::append_query("http://h/e?ckSize=4", "r", "1"),
            "http://h/e?ckSize=4&r=1"
        );
    }

    #[test]
    fn parse_http_rejects_other_schemes() {
        assert!(UrlUtil::parse_http("https://h/x").is_ok());
        assert!(matches!(
            UrlUtil::parse_http("ftp://h/x"),
            Err(UrlError::UnsupportedScheme { ref scheme, .. }) if scheme == "ftp"
        ));
        let err = UrlUtil::parse_http("garbage.php").unwrap_err();
        assert!(matches!(err, UrlError::Invalid { .. }));
        assert!(err.to_string().starts_with("invalid URL 'garbage.php'"));
    }
}
