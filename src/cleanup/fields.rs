//! Field cleaners. Each returns `Some(replacement)` when the stored value
//! should change and `None` when it should be left alone.

use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::debug;

use super::tls::{ProviderTlsSupport, TlsProbe};

/// Machine-generated or license boilerplate tags, compared lower-cased.
pub const TAG_BLACKLIST: &[&str] = &[
    "no person",
    "squareformat",
    "uploaded:by=flickrmobile",
    "uploaded:by=instagram",
    "flickriosapp:filter=flamingo",
    "cc0",
    "by",
    "by-nc",
    "by-nd",
    "by-sa",
    "by-nc-nd",
    "by-nc-sa",
    "pdm",
];

/// Tags carrying an accuracy below this are dropped.
pub const TAG_MIN_CONFIDENCE: f64 = 0.90;

/// Length of the RFC 3986 scheme at the start of `url`, if there is one.
fn scheme_len(url: &str) -> Option<usize> {
    let colon = url.find(':')?;
    let scheme = &url[..colon];
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        Some(colon)
    } else {
        None
    }
}

/// Whether `url` already names a scheme (`http:`, `https:`, `ftp:` ...).
pub fn has_scheme(url: &str) -> bool {
    scheme_len(url).is_some()
}

/// Whether `url` names a scheme followed by `//`. Unlike [`has_scheme`],
/// `host:8080/path` does not count.
pub(crate) fn has_authority_scheme(url: &str) -> bool {
    scheme_len(url).is_some_and(|n| url[n + 1..].starts_with("//"))
}

/// Whether `url` starts with `scheme://`, ignoring ASCII case.
pub(crate) fn starts_with_scheme(url: &str, scheme: &str) -> bool {
    url.len() > scheme.len() + 3
        && url.is_char_boundary(scheme.len())
        && url[..scheme.len()].eq_ignore_ascii_case(scheme)
        && url[scheme.len()..].starts_with("://")
}

/// Prefix a scheme-less URL with the chosen scheme. Returns `None` when the
/// URL already has one.
pub fn qualify_url(url: &str, prefer_https: bool) -> Option<String> {
    if has_scheme(url) {
        return None;
    }
    let scheme = if prefer_https { "https" } else { "http" };
    match url.strip_prefix("//") {
        Some(rest) => Some(format!("{scheme}://{rest}")),
        None => Some(format!("{scheme}://{url}")),
    }
}

/// Add a scheme to a URL missing one, using the provider's TLS decision.
///
/// A provider absent from `tls` is probed once with this URL and the answer
/// is recorded in `tls` as a discovery.
pub async fn cleanup_url(
    url: &str,
    tls: &mut ProviderTlsSupport,
    provider: &str,
    prober: &dyn TlsProbe,
) -> Option<String> {
    if has_scheme(url) {
        return None;
    }
    let prefer_https = match tls.get(provider) {
        Some(decision) => decision,
        None => {
            let decision = prober.supports_tls(url).await;
            debug!(provider, url, decision, "on-demand TLS probe");
            tls.record_discovery(provider, decision);
            decision
        }
    };
    qualify_url(url, prefer_https)
}

/// Drop blacklisted and low-confidence tags.
///
/// Returns the retained tags, in their original order and untouched, when at
/// least one survives. When none survive the result is `None` as well, so a
/// row whose every tag is filtered keeps its stored tags.
///
/// Each tag must be an object with a string `name`; anything else is an
/// error.
pub fn cleanup_tags(tags: &Value) -> Result<Option<Value>> {
    let items = match tags {
        Value::Null => return Ok(None),
        Value::Array(items) => items,
        other => return Err(anyhow!("tag collection is not an array: {other}")),
    };

    let mut retained = Vec::with_capacity(items.len());
    for tag in items {
        let name = tag
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("malformed tag record: {tag}"))?;
        let accuracy = match tag.get("accuracy") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_f64()
                    .ok_or_else(|| anyhow!("malformed tag accuracy: {tag}"))?,
            ),
        };
        let below_threshold = accuracy.is_some_and(|a| a < TAG_MIN_CONFIDENCE);
        let blacklisted = TAG_BLACKLIST.contains(&name.to_lowercase().as_str());
        if !(blacklisted || below_threshold) {
            retained.push(tag.clone());
        }
    }

    if retained.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Value::Array(retained)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::tls::tests::FixedProbe;
    use serde_json::json;

    #[test]
    fn detects_schemes() {
        assert!(has_scheme("http://example.com/a.jpg"));
        assert!(has_scheme("HTTPS://example.com"));
        assert!(has_scheme("ftp://files.example.com/a"));
        assert!(!has_scheme("www.example.com/x.jpg"));
        assert!(!has_scheme("//cdn.example.com/x.jpg"));
        assert!(!has_scheme("images/a:b.jpg"));
        assert!(!has_scheme("1x.example.com:8080/a"));
    }

    #[test]
    fn authority_schemes_need_slashes() {
        assert!(has_authority_scheme("ftp://files.example.com/a"));
        assert!(has_authority_scheme("HTTPS://example.com"));
        assert!(!has_authority_scheme("www.example.com:8080/x.jpg"));
        assert!(!has_authority_scheme("mailto:someone@example.com"));
        assert!(!has_authority_scheme("//cdn.example.com/x.jpg"));
    }

    #[test]
    fn qualified_urls_are_never_changed() {
        for url in [
            "http://example.com/y.jpg",
            "https://example.com/y.jpg",
            "Http://example.com/y.jpg",
            "ftp://example.com/y.jpg",
        ] {
            assert_eq!(qualify_url(url, true), None, "{url}");
            assert_eq!(qualify_url(url, false), None, "{url}");
        }
    }

    #[test]
    fn scheme_follows_tls_decision() {
        assert_eq!(
            qualify_url("www.example.com/x.jpg", true).as_deref(),
            Some("https://www.example.com/x.jpg")
        );
        assert_eq!(
            qualify_url("www.example.com/x.jpg", false).as_deref(),
            Some("http://www.example.com/x.jpg")
        );
        assert_eq!(
            qualify_url("//cdn.example.com/x.jpg", true).as_deref(),
            Some("https://cdn.example.com/x.jpg")
        );
    }

    #[test]
    fn matches_scheme_prefix_case_insensitively() {
        assert!(starts_with_scheme("HTTP://a.b", "http"));
        assert!(!starts_with_scheme("https://a.b", "http"));
        assert!(!starts_with_scheme("http:/a.b", "http"));
        assert!(!starts_with_scheme("http://", "http"));
    }

    #[tokio::test]
    async fn cleanup_url_uses_known_decision_without_probing() {
        let probe = FixedProbe::new(false);
        let mut tls = ProviderTlsSupport::from_iter([("flickr".to_string(), true)]);
        let out = cleanup_url("www.example.com/x.jpg", &mut tls, "flickr", &probe).await;
        assert_eq!(out.as_deref(), Some("https://www.example.com/x.jpg"));
        assert_eq!(probe.calls(), 0);
        assert!(tls.discoveries().is_empty());
    }

    #[tokio::test]
    async fn cleanup_url_probes_unknown_provider_once() {
        let probe = FixedProbe::new(false);
        let mut tls = ProviderTlsSupport::default();
        let first = cleanup_url("a.example.com/1.jpg", &mut tls, "museum", &probe).await;
        let second = cleanup_url("a.example.com/2.jpg", &mut tls, "museum", &probe).await;
        assert_eq!(first.as_deref(), Some("http://a.example.com/1.jpg"));
        assert_eq!(second.as_deref(), Some("http://a.example.com/2.jpg"));
        assert_eq!(probe.calls(), 1);
        assert_eq!(tls.discoveries().get("museum"), Some(&false));
    }

    #[tokio::test]
    async fn cleanup_url_leaves_qualified_urls_for_any_decision() {
        let probe = FixedProbe::new(true);
        for decision in [true, false] {
            let mut tls = ProviderTlsSupport::from_iter([("flickr".to_string(), decision)]);
            let out = cleanup_url("http://example.com/y.jpg", &mut tls, "flickr", &probe).await;
            assert_eq!(out, None);
        }
        assert_eq!(probe.calls(), 0);
    }

    #[test]
    fn drops_blacklisted_and_low_confidence_tags() {
        let tags = json!([
            {"name": "CC0", "accuracy": 1.0},
            {"name": "sunset", "accuracy": 0.95},
            {"name": "beach", "accuracy": 0.42},
            {"name": "No Person"},
            {"name": "dog", "provider": "clarifai"},
            {"name": "edge", "accuracy": 0.90},
        ]);
        let cleaned = cleanup_tags(&tags).unwrap().unwrap();
        assert_eq!(
            cleaned,
            json!([
                {"name": "sunset", "accuracy": 0.95},
                {"name": "dog", "provider": "clarifai"},
                {"name": "edge", "accuracy": 0.90},
            ])
        );
    }

    #[test]
    fn retained_tags_are_an_ordered_subset() {
        let tags = json!([
            {"name": "a", "accuracy": 0.99},
            {"name": "by-nc-sa"},
            {"name": "b", "accuracy": 0.2},
            {"name": "c"},
        ]);
        let input = tags.as_array().unwrap();
        let cleaned = cleanup_tags(&tags).unwrap().unwrap();
        let cleaned = cleaned.as_array().unwrap();
        let mut cursor = input.iter();
        for kept in cleaned {
            assert!(cursor.any(|t| t == kept), "{kept} out of order or new");
        }
    }

    #[test]
    fn unfiltered_tags_are_still_returned() {
        let tags = json!([{"name": "sunset", "accuracy": 0.95}]);
        assert_eq!(cleanup_tags(&tags).unwrap(), Some(tags.clone()));
    }

    // Known gap: a collection where every tag is filtered is not rewritten
    // to an empty array, so the boilerplate stays in staging.
    #[test]
    fn all_filtered_tags_produce_no_update() {
        let tags = json!([
            {"name": "cc0", "accuracy": 1.0},
            {"name": "blurry", "accuracy": 0.3},
        ]);
        assert_eq!(cleanup_tags(&tags).unwrap(), None);
    }

    #[test]
    fn empty_and_null_collections_are_untouched() {
        assert_eq!(cleanup_tags(&json!([])).unwrap(), None);
        assert_eq!(cleanup_tags(&Value::Null).unwrap(), None);
    }

    #[test]
    fn malformed_tags_are_errors() {
        assert!(cleanup_tags(&json!([{"accuracy": 0.99}])).is_err());
        assert!(cleanup_tags(&json!([{"name": 7}])).is_err());
        assert!(cleanup_tags(&json!([{"name": "x", "accuracy": "high"}])).is_err());
        assert!(cleanup_tags(&json!({"name": "x"})).is_err());
    }
}
