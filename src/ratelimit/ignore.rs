//! Header-based exemption from rate limiting.

use super::policy::IgnoreRule;
use super::request::RequestAttributes;

/// Decide whether a request bypasses rate limiting.
///
/// A malformed rule or an absent header never exempts the request. Values
/// are compared exactly.
pub fn should_ignore<R: RequestAttributes + ?Sized>(rule: &IgnoreRule, request: &R) -> bool {
    let Some(header) = rule.header() else {
        return false;
    };
    let Some(value) = request.header(header) else {
        return false;
    };
    rule.values().iter().any(|allowed| allowed == value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(headers: &[(&str, &str)]) -> http::Request<()> {
        let mut builder = http::Request::builder();
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_matching_value_is_ignored() {
        let rule = IgnoreRule::new("X-Debug", ["1"]);
        assert!(should_ignore(&rule, &request_with(&[("X-Debug", "1")])));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let rule = IgnoreRule::new("x-debug", ["1"]);
        assert!(should_ignore(&rule, &request_with(&[("X-DEBUG", "1")])));
    }

    #[test]
    fn test_any_configured_value_matches() {
        let rule = IgnoreRule::new("X-Probe", ["lb", "healthcheck"]);
        assert!(should_ignore(&rule, &request_with(&[("X-Probe", "healthcheck")])));
    }

    #[test]
    fn test_value_match_is_exact() {
        let rule = IgnoreRule::new("X-Debug", ["1"]);
        assert!(!should_ignore(&rule, &request_with(&[("X-Debug", "10")])));
        assert!(!should_ignore(&rule, &request_with(&[("X-Debug", " 1")])));
    }

    #[test]
    fn test_absent_header_is_not_ignored() {
        let rule = IgnoreRule::new("X-Debug", ["1"]);
        assert!(!should_ignore(&rule, &request_with(&[("X-Other", "1")])));
    }

    #[test]
    fn test_malformed_rule_is_not_ignored() {
        let rule = IgnoreRule::from_elements(["X-Debug"]);
        assert!(!should_ignore(&rule, &request_with(&[("X-Debug", "X-Debug")])));
        assert!(!should_ignore(&IgnoreRule::default(), &request_with(&[])));
    }
}
