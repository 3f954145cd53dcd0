use hyper::header::HOST;
use hyper::Request;
use regex::Regex;

/// A single host spoofing rule: a pattern matched against the normalized
/// `host:port` string and a replacement template.
///
/// The template supports `$n` capture-group substitution, so a rule like
/// `^(.+)\.dev:80$` -> `$1.local:8080` redirects every `.dev` host to its
/// `.local` counterpart.
#[derive(Debug, Clone)]
pub struct SpoofRule {
    matcher: Regex,
    template: String,
}

impl SpoofRule {
    pub fn new(pattern: &str, template: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            matcher: Regex::new(pattern)?,
            template: template.into(),
        })
    }

    pub fn is_match(&self, host: &str) -> bool {
        self.matcher.is_match(host)
    }

    /// Substitute capture groups of every non-overlapping match into the
    /// replacement template.
    pub fn replace(&self, host: &str) -> String {
        self.matcher
            .replace_all(host, self.template.as_str())
            .into_owned()
    }
}

/// Ordered set of spoofing rules. Evaluation order is declaration order and
/// the first matching rule wins; later rules are not consulted.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<SpoofRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<SpoofRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Resolve a normalized `host:port` against the rule set.
    ///
    /// Returns the first matching rule's replacement, or `None` when no rule
    /// matches and the original host should be used downstream.
    pub fn resolve(&self, host: &str) -> Option<String> {
        self.rules
            .iter()
            .find(|rule| rule.is_match(host))
            .map(|rule| rule.replace(host))
    }
}

/// Produce the canonical `host:port` string for a request.
///
/// The declared Host header takes precedence, falling back to the request
/// target's authority. A host that already carries an explicit port is
/// returned unchanged; otherwise the port defaults to 443 for https targets
/// and 80 for everything else. Returns `None` when the request declares no
/// host at all.
pub fn normalize_host<B>(req: &Request<B>) -> Option<String> {
    let host_header = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty());
    let authority = req.uri().authority().map(|a| a.as_str());

    let declared = host_header.or(authority)?;
    if host_has_port(declared) {
        return Some(declared.to_string());
    }
    if let Some(auth) = authority {
        if host_has_port(auth) {
            return Some(auth.to_string());
        }
    }

    let port = if req.uri().scheme_str() == Some("https") {
        443
    } else {
        80
    };
    Some(format!("{declared}:{port}"))
}

/// A host carries an explicit port when a colon appears after any closing
/// bracket, which keeps `[::1]:8080` and `[::1]` apart.
fn host_has_port(host: &str) -> bool {
    match (host.rfind(':'), host.rfind(']')) {
        (Some(colon), Some(bracket)) => colon > bracket,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;

    fn request(uri: &str, host_header: Option<&str>) -> Request<Empty<bytes::Bytes>> {
        let mut builder = Request::builder().uri(uri);
        if let Some(h) = host_header {
            builder = builder.header(HOST, h);
        }
        builder.body(Empty::new()).unwrap()
    }

    #[test]
    fn normalize_adds_default_http_port() {
        let req = request("http://example.com/path", Some("example.com"));
        assert_eq!(normalize_host(&req), Some("example.com:80".to_string()));
    }

    #[test]
    fn normalize_adds_default_https_port() {
        let req = request("https://example.com/", Some("example.com"));
        assert_eq!(normalize_host(&req), Some("example.com:443".to_string()));
    }

    #[test]
    fn normalize_keeps_explicit_port() {
        let req = request("http://example.com:9000/", Some("example.com:9000"));
        assert_eq!(normalize_host(&req), Some("example.com:9000".to_string()));
    }

    #[test]
    fn normalize_prefers_host_header_over_authority() {
        let req = request("http://other.com:8080/", Some("example.com:9000"));
        assert_eq!(normalize_host(&req), Some("example.com:9000".to_string()));
    }

    #[test]
    fn normalize_falls_back_to_authority_port() {
        // Host header without a port, authority with one.
        let req = request("http://example.com:9000/", Some("example.com"));
        assert_eq!(normalize_host(&req), Some("example.com:9000".to_string()));
    }

    #[test]
    fn normalize_is_idempotent() {
        let req = request("http://example.com/", Some("example.com"));
        let once = normalize_host(&req).unwrap();
        let again = request(&format!("http://{once}/"), Some(&once));
        assert_eq!(normalize_host(&again), Some(once));
    }

    #[test]
    fn normalize_bracketed_ipv6_without_port() {
        let req = request("http://[::1]/", Some("[::1]"));
        assert_eq!(normalize_host(&req), Some("[::1]:80".to_string()));
    }

    #[test]
    fn normalize_bracketed_ipv6_with_port() {
        let req = request("http://[::1]:8443/", Some("[::1]:8443"));
        assert_eq!(normalize_host(&req), Some("[::1]:8443".to_string()));
    }

    #[test]
    fn unbracketed_ipv6_is_treated_as_already_ported() {
        // Port detection is bracket-aware: a bare IPv6 literal contains
        // colons and is therefore taken verbatim, matching the intended
        // behavior for hosts written without brackets.
        assert!(host_has_port("::1"));
        assert!(host_has_port("example.com:80"));
        assert!(!host_has_port("example.com"));
        assert!(!host_has_port("[::1]"));
        assert!(host_has_port("[::1]:443"));
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = RuleSet::new(vec![
            SpoofRule::new(r"^test\.com:80$", "127.0.0.1:9000").unwrap(),
            SpoofRule::new(r"^test\.com:80$", "127.0.0.1:9999").unwrap(),
        ]);
        assert_eq!(rules.resolve("test.com:80"), Some("127.0.0.1:9000".into()));
    }

    #[test]
    fn no_match_is_passthrough() {
        let rules = RuleSet::new(vec![
            SpoofRule::new(r"^test\.com:80$", "127.0.0.1:9000").unwrap()
        ]);
        assert_eq!(rules.resolve("other.com:80"), None);
    }

    #[test]
    fn replacement_substitutes_capture_groups() {
        let rule = SpoofRule::new(r"^(.+)\.dev:80$", "$1.local:8080").unwrap();
        assert!(rule.is_match("api.dev:80"));
        assert_eq!(rule.replace("api.dev:80"), "api.local:8080");
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(SpoofRule::new(r"(unclosed", "x").is_err());
    }
}
