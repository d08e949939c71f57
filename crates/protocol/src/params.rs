//! Channel establishment parameters.
//!
//! The session id, working directory and initial geometry travel in the
//! query string of the channel's upgrade request:
//! `?sessionId=<id>&cwd=<path>&cols=<n>&rows=<n>`.

use url::form_urlencoded;
use url::Url;

use crate::messages::Geometry;

/// Parameters a client supplies when opening a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelParams {
    /// Session to resolve or create. `None` means "always new".
    pub session_id: Option<String>,
    /// Requested working directory.
    pub cwd: Option<String>,
    /// Requested columns.
    pub cols: Option<u16>,
    /// Requested rows.
    pub rows: Option<u16>,
}

impl ChannelParams {
    /// Creates parameters naming a session.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    /// Sets the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets the initial geometry.
    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.cols = Some(geometry.cols);
        self.rows = Some(geometry.rows);
        self
    }

    /// Parses a query string leniently.
    ///
    /// Unknown keys are ignored, empty values count as absent and
    /// unparsable numbers are dropped.
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut params = Self::default();

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "sessionId" => params.session_id = Some(value.into_owned()),
                "cwd" => params.cwd = Some(value.into_owned()),
                "cols" => params.cols = value.parse().ok(),
                "rows" => params.rows = value.parse().ok(),
                _ => {}
            }
        }

        params
    }

    /// Encodes the parameters as a query string (without leading `?`).
    pub fn to_query(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        if let Some(ref id) = self.session_id {
            serializer.append_pair("sessionId", id);
        }
        if let Some(ref cwd) = self.cwd {
            serializer.append_pair("cwd", cwd);
        }
        if let Some(cols) = self.cols {
            serializer.append_pair("cols", &cols.to_string());
        }
        if let Some(rows) = self.rows {
            serializer.append_pair("rows", &rows.to_string());
        }
        serializer.finish()
    }

    /// Returns `base` with these parameters as its query string.
    pub fn to_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        let query = self.to_query();
        url.set_query(if query.is_empty() { None } else { Some(&query) });
        url
    }

    /// Resolves the requested geometry, substituting `fallback` for any
    /// missing or zero dimension.
    pub fn geometry_or(&self, fallback: Geometry) -> Geometry {
        let cols = self.cols.filter(|c| *c > 0).unwrap_or(fallback.cols);
        let rows = self.rows.filter(|r| *r > 0).unwrap_or(fallback.rows);
        Geometry { cols, rows }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_roundtrip_with_special_characters() {
        let params = ChannelParams::new("s 1&2")
            .with_cwd("/home/dev/my project")
            .with_geometry(Geometry::new(100, 30).unwrap());

        let query = params.to_query();
        assert!(!query.contains(' '));
        assert_eq!(ChannelParams::from_query(&query), params);
    }

    #[test]
    fn test_from_query_accepts_leading_question_mark() {
        let params = ChannelParams::from_query("?sessionId=abc&cols=90&rows=20");
        assert_eq!(params.session_id.as_deref(), Some("abc"));
        assert_eq!(params.cols, Some(90));
        assert_eq!(params.rows, Some(20));
        assert!(params.cwd.is_none());
    }

    #[test]
    fn test_from_query_is_lenient() {
        let params = ChannelParams::from_query("sessionId=&cols=wide&rows=-3&extra=1");
        assert_eq!(params, ChannelParams::default());
    }

    #[test]
    fn test_geometry_or_defaults_missing_and_zero() {
        let fallback = Geometry::default();

        assert_eq!(ChannelParams::default().geometry_or(fallback), fallback);

        let params = ChannelParams {
            cols: Some(0),
            rows: Some(50),
            ..Default::default()
        };
        assert_eq!(
            params.geometry_or(fallback),
            Geometry { cols: 80, rows: 50 }
        );
    }

    #[test]
    fn test_to_url_replaces_query() {
        let base = Url::parse("ws://127.0.0.1:3001/terminal?stale=1").unwrap();
        let url = ChannelParams::new("s1").to_url(&base);
        assert_eq!(url.as_str(), "ws://127.0.0.1:3001/terminal?sessionId=s1");

        let bare = ChannelParams::default().to_url(&base);
        assert_eq!(bare.as_str(), "ws://127.0.0.1:3001/terminal");
    }
}
