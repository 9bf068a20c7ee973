//! The endpoint allow-list: parsing, normalisation and matching.
//!
//! Operator input is a whitespace-separated list of `domain[:port]` tokens.
//! Domains containing a `*` are wildcard patterns; everything else is an
//! exact name. A name is classified exactly once; the two maps are disjoint.

use std::collections::HashMap;

pub const DEFAULT_PORT: u16 = 443;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Fully-qualified, lower-case, with trailing dot.
    pub domain: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(domain: &str, port: u16) -> Self {
        Self {
            domain: fqdn(domain),
            port,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EndpointPolicy {
    exact: HashMap<String, Vec<Endpoint>>,
    wildcard: HashMap<String, Vec<Endpoint>>,
}

impl EndpointPolicy {
    /// Parses the operator's `allowed_endpoints` string.
    ///
    /// Unparsable ports fall back to 443 rather than rejecting the whole
    /// config; a typo in one token should not strand the job without any
    /// allowed endpoints.
    pub fn parse(text: &str) -> Self {
        let mut policy = Self::default();

        for token in text.split_whitespace() {
            let (domain, port) = match token.rsplit_once(':') {
                Some((domain, port)) => (domain, port.parse().unwrap_or(DEFAULT_PORT)),
                None => (token, DEFAULT_PORT),
            };

            if domain.is_empty() {
                continue;
            }

            let endpoint = Endpoint::new(domain, port);
            let map = if domain.contains('*') {
                &mut policy.wildcard
            } else {
                &mut policy.exact
            };

            let endpoints = map.entry(endpoint.domain.clone()).or_default();
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }

        policy
    }

    /// Adds the implicit endpoints to the exact map.
    ///
    /// These are always exact names; they are merged after the operator set
    /// has been classified so they can never shadow a wildcard pattern.
    pub fn merge_implicit(&mut self, implicit: impl IntoIterator<Item = Endpoint>) {
        for endpoint in implicit {
            let endpoints = self.exact.entry(endpoint.domain.clone()).or_default();
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }
    }

    pub fn is_exact_allowed(&self, name: &str) -> bool {
        self.exact.contains_key(&fqdn(name))
    }

    /// Returns the first wildcard pattern matching `name` and its endpoints.
    pub fn match_wildcard(&self, name: &str) -> Option<(&str, &[Endpoint])> {
        let name = fqdn(name);

        self.wildcard
            .iter()
            .find(|(pattern, _)| wildcard_matches(pattern, &name))
            .map(|(pattern, endpoints)| (pattern.as_str(), endpoints.as_slice()))
    }

    /// All exact names and their endpoints; the refresher and the block-mode
    /// pre-resolve walk this.
    pub fn exact(&self) -> impl Iterator<Item = (&str, &[Endpoint])> {
        self.exact
            .iter()
            .map(|(name, endpoints)| (name.as_str(), endpoints.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }

    /// Renders the policy back into `domain:port` tokens (order unspecified).
    pub fn format(&self) -> String {
        let mut tokens = self
            .exact
            .values()
            .chain(self.wildcard.values())
            .flatten()
            .map(|endpoint| format!("{}:{}", endpoint.domain, endpoint.port))
            .collect::<Vec<_>>();
        tokens.sort();

        tokens.join(" ")
    }
}

/// Normalises a domain name: lower-case with a trailing dot.
pub fn fqdn(name: &str) -> String {
    let mut name = name.to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }

    name
}

/// Wildcard match as understood by the allow-list.
///
/// The pattern is split at its first `*`: a non-empty prefix must match the
/// start of the name and the suffix its end; with an empty prefix only the
/// suffix is checked. Label boundaries are not enforced, so `*.foo.com.`
/// matches `x.foo.com.` as well as `x.y.foo.com.`.
pub fn wildcard_matches(pattern: &str, name: &str) -> bool {
    let Some((prefix, suffix)) = pattern.split_once('*') else {
        return pattern == name;
    };

    if name.len() < prefix.len() + suffix.len() {
        return false;
    }

    if prefix.is_empty() {
        name.ends_with(suffix)
    } else {
        name.starts_with(prefix) && name.ends_with(suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tokens_with_default_port() {
        let policy = EndpointPolicy::parse("github.com example.com:8443");

        assert!(policy.is_exact_allowed("github.com"));
        assert!(policy.is_exact_allowed("GITHUB.COM."));
        assert!(!policy.is_exact_allowed("gitlab.com"));

        let endpoints = policy.exact().collect::<HashMap<_, _>>();
        assert_eq!(
            endpoints["example.com."],
            [Endpoint::new("example.com", 8443)]
        );
        assert_eq!(endpoints["github.com."], [Endpoint::new("github.com", 443)]);
    }

    #[test]
    fn classifies_each_name_exactly_once() {
        let policy = EndpointPolicy::parse("*.data.example.com:443 data.example.com:443");

        assert!(policy.is_exact_allowed("data.example.com"));
        assert!(policy.match_wildcard("west.data.example.com").is_some());
        // The wildcard map must not also hold the exact name.
        assert!(policy.match_wildcard("data.example.com").is_none());
    }

    #[test]
    fn wildcard_matches_nested_labels() {
        let pattern = fqdn("*.foo.com");

        assert!(wildcard_matches(&pattern, &fqdn("x.foo.com")));
        assert!(wildcard_matches(&pattern, &fqdn("x.y.foo.com")));
        assert!(!wildcard_matches(&pattern, &fqdn("xfoo.com")));
        assert!(!wildcard_matches(&pattern, &fqdn("foo.com")));
    }

    #[test]
    fn wildcard_with_prefix_and_suffix() {
        let pattern = fqdn("west*.blob.example.com");

        assert!(wildcard_matches(&pattern, &fqdn("westus2.blob.example.com")));
        assert!(!wildcard_matches(&pattern, &fqdn("eastus.blob.example.com")));
    }

    #[test]
    fn implicit_endpoints_deduplicate() {
        let mut policy = EndpointPolicy::parse("pipelines.actions.githubusercontent.com:443");
        policy.merge_implicit([Endpoint::new("pipelines.actions.githubusercontent.com", 443)]);

        let endpoints = policy.exact().collect::<HashMap<_, _>>();
        assert_eq!(endpoints["pipelines.actions.githubusercontent.com."].len(), 1);
    }

    #[test]
    fn parse_format_roundtrip() {
        let text = "*.pkg.dev:443 example.com:8443 github.com:443";
        let policy = EndpointPolicy::parse(text);

        let reparsed = EndpointPolicy::parse(&policy.format());

        assert_eq!(policy.format(), reparsed.format());
        assert_eq!(reparsed.format(), "*.pkg.dev.:443 example.com.:8443 github.com.:443");
    }

    #[test]
    fn bad_port_falls_back_to_default() {
        let policy = EndpointPolicy::parse("example.com:notaport");

        let endpoints = policy.exact().collect::<HashMap<_, _>>();
        assert_eq!(endpoints["example.com."], [Endpoint::new("example.com", 443)]);
    }
}
