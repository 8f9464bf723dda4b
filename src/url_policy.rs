use std::fmt;

use url::Url;

/// Returns true when `input` is an absolute http(s) URL whose host is one of
/// `allowed_hosts` or a subdomain of one. Malformed and disallowed URLs are
/// both reported as `false`.
pub fn is_allowed_url(input: &str, allowed_hosts: &[String]) -> bool {
    let Some(host) = normalized_host(input) else {
        return false;
    };

    allowed_hosts
        .iter()
        .any(|domain| is_domain_match(&host, domain))
}

/// Lowercased host with a leading `www.` removed, or `None` when `input` is
/// not an absolute web URL.
fn normalized_host(input: &str) -> Option<String> {
    let parsed = Url::parse(input.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }

    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

fn is_domain_match(host: &str, domain: &str) -> bool {
    let domain = domain.trim().to_ascii_lowercase();
    !domain.is_empty() && (host == domain || host.ends_with(&format!(".{domain}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Youtube,
    Tiktok,
    X,
    Instagram,
    Unknown,
}

impl Platform {
    /// Never fails: anything that cannot be classified is `Unknown`.
    pub fn detect(input: &str) -> Self {
        let Some(host) = normalized_host(input) else {
            return Self::Unknown;
        };

        const TABLE: [(&str, Platform); 7] = [
            ("youtube.com", Platform::Youtube),
            ("youtu.be", Platform::Youtube),
            ("x.com", Platform::X),
            ("twitter.com", Platform::X),
            ("tiktok.com", Platform::Tiktok),
            ("instagram.com", Platform::Instagram),
            ("instagr.am", Platform::Instagram),
        ];

        TABLE
            .iter()
            .find(|(domain, _)| is_domain_match(&host, domain))
            .map(|(_, platform)| *platform)
            .unwrap_or(Self::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::Tiktok => "tiktok",
            Self::X => "x",
            Self::Instagram => "instagram",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
