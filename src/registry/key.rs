//! Stream identity

/// Unique name of a published stream (app + stream name)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    /// Application name (e.g., "live")
    pub app: String,
    /// Stream name/key (e.g., "stream_key_123")
    pub name: String,
}

impl StreamKey {
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
        }
    }

    /// Parse `app/name`. Both parts must be non-empty; the name may itself
    /// contain slashes.
    pub fn parse(path: &str) -> Option<Self> {
        let (app, name) = path.trim_matches('/').split_once('/')?;
        if app.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(app, name))
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.app, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(StreamKey::parse("live/s1"), Some(StreamKey::new("live", "s1")));
        assert_eq!(StreamKey::parse("/live/a/b"), Some(StreamKey::new("live", "a/b")));
        assert_eq!(StreamKey::parse("live"), None);
        assert_eq!(StreamKey::parse("live/"), None);
        assert_eq!(StreamKey::parse("/s1"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(StreamKey::new("live", "s1").to_string(), "live/s1");
    }
}
