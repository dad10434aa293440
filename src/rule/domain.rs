//! Domain-based rule implementation.

use std::fmt;
use std::str::FromStr;

use super::DynamicRule;
use crate::error::DomainRuleError;
use crate::verdict::DomainClass;

/// A single compiled domain pattern.
///
/// All names are stored lowercase without a trailing dot; matching is ASCII
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DomainPattern {
    /// `example.com` - matches only `example.com`
    Exact(String),
    /// `*.example.com` - matches `example.com` and names exactly one label below it
    SuffixWildcard(String),
    /// `+.example.com` - matches `example.com` and every name below it
    SubtreeRequired(String),
}

impl DomainPattern {
    /// The domain part of the pattern, without any wildcard prefix.
    pub fn domain(&self) -> &str {
        match self {
            DomainPattern::Exact(d)
            | DomainPattern::SuffixWildcard(d)
            | DomainPattern::SubtreeRequired(d) => d,
        }
    }

    /// Match a normalized (lowercase, no trailing dot) query name.
    fn matches_normalized(&self, name: &str) -> bool {
        match self {
            DomainPattern::Exact(d) => name == d,
            DomainPattern::SuffixWildcard(d) => {
                if name == d {
                    return true;
                }
                match name.split_once('.') {
                    Some((_, rest)) => rest == d,
                    None => false,
                }
            }
            DomainPattern::SubtreeRequired(d) => {
                name == d
                    || (name.len() > d.len()
                        && name.ends_with(d.as_str())
                        && name.as_bytes()[name.len() - d.len() - 1] == b'.')
            }
        }
    }

    /// Match a query name (any case, optional trailing dot).
    pub fn matches(&self, name: &str) -> bool {
        self.matches_normalized(&normalize(name))
    }
}

impl FromStr for DomainPattern {
    type Err = DomainRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();

        let (ctor, rest): (fn(String) -> DomainPattern, &str) =
            if let Some(rest) = raw.strip_prefix("+.") {
                (DomainPattern::SubtreeRequired, rest)
            } else if let Some(rest) = raw.strip_prefix("*.") {
                (DomainPattern::SuffixWildcard, rest)
            } else {
                let exact = normalize(raw);
                if exact.is_empty() {
                    return Err(DomainRuleError::EmptyPattern);
                }
                return Ok(DomainPattern::Exact(exact));
            };

        let rest = normalize(rest);
        if rest.is_empty() {
            return Err(DomainRuleError::MissingSuffix(raw.to_string()));
        }
        Ok(ctor(rest))
    }
}

impl fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainPattern::Exact(d) => write!(f, "{}", d),
            DomainPattern::SuffixWildcard(d) => write!(f, "*.{}", d),
            DomainPattern::SubtreeRequired(d) => write!(f, "+.{}", d),
        }
    }
}

/// Lowercase a name and strip the root label dot.
fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// DomainMatcher evaluates an ordered list of domain patterns.
///
/// Patterns are tried in configured order and the first match wins.
///
/// # Examples
/// ```
/// use dns_fallback::rule::{DomainMatcher, DynamicRule};
/// use dns_fallback::DomainClass;
///
/// let matcher = DomainMatcher::build(["*.example.com", "+.google.com", "exact.org"]);
/// assert_eq!(matcher.classify("www.example.com"), DomainClass::Bypass);
/// assert_eq!(matcher.classify("a.b.google.com."), DomainClass::Bypass);
/// assert_eq!(matcher.classify("other.com"), DomainClass::Normal);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DomainMatcher {
    patterns: Vec<DomainPattern>,
}

impl DomainMatcher {
    /// Create an empty matcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the matcher has no patterns.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The compiled patterns in evaluation order.
    pub fn patterns(&self) -> &[DomainPattern] {
        &self.patterns
    }

    /// Find the first pattern matching `name`.
    pub fn find(&self, name: &str) -> Option<&DomainPattern> {
        if self.patterns.is_empty() {
            return None;
        }
        let name = normalize(name);
        self.patterns.iter().find(|p| p.matches_normalized(&name))
    }

    /// Whether any pattern matches `name`.
    pub fn matches(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Classify a query name: any match sends it straight to fallback.
    pub fn classify(&self, name: &str) -> DomainClass {
        if self.matches(name) {
            DomainClass::Bypass
        } else {
            DomainClass::Normal
        }
    }
}

impl DynamicRule for DomainMatcher {
    type Error = DomainRuleError;
    const KIND: &'static str = "domain";

    fn add_pattern(&mut self, pattern: &str) -> Result<(), Self::Error> {
        let pattern: DomainPattern = pattern.parse()?;
        self.patterns.push(pattern);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let matcher = DomainMatcher::build(["google.com"]);

        assert!(matcher.matches("google.com"));
        assert!(matcher.matches("GOOGLE.COM"));
        assert!(matcher.matches("Google.Com."));
        assert!(!matcher.matches("www.google.com"));
        assert!(!matcher.matches("oogle.com"));
    }

    #[test]
    fn test_wildcard_match() {
        let matcher = DomainMatcher::build(["*.example.com"]);

        assert_eq!(matcher.classify("sub.example.com"), DomainClass::Bypass);
        assert_eq!(matcher.classify("example.com"), DomainClass::Bypass);
        assert_eq!(matcher.classify("SUB.Example.COM."), DomainClass::Bypass);
        assert_eq!(matcher.classify("other.com"), DomainClass::Normal);
        assert_eq!(matcher.classify("notexample.com"), DomainClass::Normal);
        // Only one label is stripped
        assert_eq!(matcher.classify("a.b.example.com"), DomainClass::Normal);
    }

    #[test]
    fn test_subtree_match() {
        let matcher = DomainMatcher::build(["+.example.com"]);

        assert_eq!(matcher.classify("example.com"), DomainClass::Bypass);
        assert_eq!(matcher.classify("sub.example.com"), DomainClass::Bypass);
        assert_eq!(matcher.classify("a.b.c.example.com"), DomainClass::Bypass);
        assert_eq!(matcher.classify("notexample.com"), DomainClass::Normal);
        assert_eq!(matcher.classify("example.com.cn"), DomainClass::Normal);
        assert_eq!(matcher.classify("com"), DomainClass::Normal);
    }

    #[test]
    fn test_first_match_wins() {
        let matcher = DomainMatcher::build(["+.example.com", "*.example.com", "www.example.com"]);

        let hit = matcher.find("www.example.com").unwrap();
        assert_eq!(hit, &DomainPattern::SubtreeRequired("example.com".to_string()));

        let matcher = DomainMatcher::build(["www.example.com", "+.example.com"]);
        let hit = matcher.find("www.example.com").unwrap();
        assert_eq!(hit, &DomainPattern::Exact("www.example.com".to_string()));
    }

    #[test]
    fn test_pattern_parsing() {
        assert_eq!(
            "*.Example.com".parse::<DomainPattern>().unwrap(),
            DomainPattern::SuffixWildcard("example.com".to_string())
        );
        assert_eq!(
            " +.cdn.net. ".parse::<DomainPattern>().unwrap(),
            DomainPattern::SubtreeRequired("cdn.net".to_string())
        );
        assert_eq!(
            "localhost".parse::<DomainPattern>().unwrap(),
            DomainPattern::Exact("localhost".to_string())
        );
    }

    #[test]
    fn test_invalid_patterns() {
        let mut matcher = DomainMatcher::new();

        assert_eq!(matcher.add_pattern(""), Err(DomainRuleError::EmptyPattern));
        assert_eq!(matcher.add_pattern("."), Err(DomainRuleError::EmptyPattern));
        assert!(matches!(
            matcher.add_pattern("*."),
            Err(DomainRuleError::MissingSuffix(_))
        ));
        assert!(matches!(
            matcher.add_pattern("+."),
            Err(DomainRuleError::MissingSuffix(_))
        ));
        assert!(matcher.is_empty());
    }

    #[test]
    fn test_display_round_trips_config_form() {
        for raw in ["example.com", "*.example.com", "+.example.com"] {
            let pattern: DomainPattern = raw.parse().unwrap();
            assert_eq!(pattern.to_string(), raw);
        }
    }

    #[test]
    fn test_single_pattern_matching() {
        let pattern: DomainPattern = "*.CDN.example.".parse().unwrap();
        assert_eq!(pattern.domain(), "cdn.example");
        assert!(pattern.matches("img.cdn.example."));
        assert!(pattern.matches("CDN.EXAMPLE"));
        assert!(!pattern.matches("a.img.cdn.example"));
    }

    #[test]
    fn test_patterns_keep_config_order() {
        let matcher = DomainMatcher::build(["b.com", "+.", "+.a.com"]);
        let domains: Vec<&str> = matcher.patterns().iter().map(|p| p.domain()).collect();
        assert_eq!(domains, vec!["b.com", "a.com"]);
    }

    #[test]
    fn test_empty_matcher() {
        let matcher = DomainMatcher::new();
        assert_eq!(matcher.classify("anything.com"), DomainClass::Normal);
    }
}
