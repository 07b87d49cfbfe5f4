//! URL normalization applied before server and stats page URLs are stored.

use reqwest::Url;

use super::DbError;

fn parse_lenient(raw: &str) -> Result<Url, DbError> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };

    let url = Url::parse(&with_scheme).map_err(|e| DbError::InvalidUrl(format!("{}: {}", raw, e)))?;
    if url.host_str().is_none() {
        return Err(DbError::InvalidUrl(format!("{}: missing host", raw)));
    }
    Ok(url)
}

/// Reduce a server URL to scheme, host and port.
pub fn normalize_server_url(raw: &str) -> Result<String, DbError> {
    let url = parse_lenient(raw)?;
    Ok(url.origin().ascii_serialization())
}

/// Drop the query (and with it any `tour` parameter) from a pilot stats page URL.
///
/// An untagged page URL always resolves to the current tour.
pub fn normalize_stats_page_url(raw: &str) -> Result<String, DbError> {
    let mut url = parse_lenient(raw)?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}
