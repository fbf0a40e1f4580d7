//! Turns whatever the user pasted into a normalized video identifier.
//!
//! Extraction is a pure function over the input string: parse it as a URL,
//! check the host against the recognized video hosts, then try a fixed,
//! ordered list of path patterns. The first pattern that matches wins, so an
//! ambiguous input always resolves the same way.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use url::Url;

/// Hosts serving the long-form site.
const SITE_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtube-nocookie.com",
    "www.youtube-nocookie.com",
];

/// Link-shortener hosts.
const SHORT_HOSTS: &[&str] = &["youtu.be", "www.youtu.be"];

/// Normalized identifier of a hosted video, e.g. `dQw4w9WgXcQ`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ResourceIdentifier(String);

impl ResourceIdentifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The URL shape that produced an identifier, in matching priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlShape {
    Watch,
    ShortLink,
    Embed,
    Shorts,
    Live,
    BarePath,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum HostClass {
    Site,
    Short,
}

struct Matcher {
    shape: UrlShape,
    host: HostClass,
    pattern: Regex,
}

const ID: &str = r"([A-Za-z0-9_-]{11})";
const END: &str = r"(?:[/?&#]|$)";

static MATCHERS: LazyLock<Vec<Matcher>> = LazyLock::new(|| {
    let build = |shape, host, pattern: String| Matcher {
        shape,
        host,
        pattern: Regex::new(&pattern).expect("identifier pattern must compile"),
    };
    vec![
        build(
            UrlShape::Watch,
            HostClass::Site,
            format!(r"^/watch/?\?(?:[^#]*&)?v={ID}{END}"),
        ),
        build(UrlShape::ShortLink, HostClass::Short, format!(r"^/{ID}{END}")),
        build(
            UrlShape::Embed,
            HostClass::Site,
            format!(r"^/(?:embed|v|e)/{ID}{END}"),
        ),
        build(UrlShape::Shorts, HostClass::Site, format!(r"^/shorts/{ID}{END}")),
        build(UrlShape::Live, HostClass::Site, format!(r"^/live/{ID}{END}")),
        build(UrlShape::BarePath, HostClass::Site, format!(r"^/{ID}{END}")),
    ]
});

/// Extracts the identifier from `input`, or `None` when the input is not a
/// recognized video URL.
pub fn extract_identifier(input: &str) -> Option<ResourceIdentifier> {
    extract_with_shape(input).map(|(_, id)| id)
}

/// Same as [`extract_identifier`] but also reports which URL shape matched.
pub fn extract_with_shape(input: &str) -> Option<(UrlShape, ResourceIdentifier)> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) {
        return None;
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&candidate).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }

    let host = url.host_str()?.to_ascii_lowercase();
    let class = if SITE_HOSTS.contains(&host.as_str()) {
        HostClass::Site
    } else if SHORT_HOSTS.contains(&host.as_str()) {
        HostClass::Short
    } else {
        return None;
    };

    let target = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    MATCHERS
        .iter()
        .filter(|matcher| matcher.host == class)
        .find_map(|matcher| {
            matcher
                .pattern
                .captures(&target)
                .and_then(|caps| caps.get(1))
                .map(|id| (matcher.shape, ResourceIdentifier(id.as_str().to_owned())))
        })
}

/// Canonical watch URL handed to acquisition backends.
pub fn canonical_watch_url(id: &ResourceIdentifier) -> String {
    format!("https://www.youtube.com/watch?v={}", id.as_str())
}
