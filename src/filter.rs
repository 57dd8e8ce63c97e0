//! Tag value predicates and their OpenTSDB wire forms
//!
//! Seven filter kinds are supported: literal-or and not-literal-or (each with
//! a case-insensitive variant), wildcard (case-sensitive and -insensitive
//! glob), and anchored regex. Inline tag values infer their kind from syntax
//! for OpenTSDB parity: a bare value containing `*` is a case-insensitive
//! wildcard, any other bare value is a literal-or on `|`.

use regex::Regex;

use crate::error::QueryError;

/// A predicate over a single tag value
#[derive(Debug, Clone)]
pub enum TagPredicate {
    /// Value is one of the listed literals
    LiteralOr(Vec<String>),

    /// Case-insensitive literal-or (stored lowercased)
    ILiteralOr(Vec<String>),

    /// Value is none of the listed literals
    NotLiteralOr(Vec<String>),

    /// Case-insensitive not-literal-or (stored lowercased)
    NotILiteralOr(Vec<String>),

    /// Case-sensitive glob (`*` matches any run of characters)
    Wildcard(Regex),

    /// Case-insensitive glob
    IWildcard(Regex),

    /// Anchored user-supplied regex
    Regexp(Regex),
}

impl TagPredicate {
    /// Parse an explicit filter from its kind name and expression
    pub fn parse(kind: &str, expr: &str) -> Result<Self, QueryError> {
        match kind {
            "literal_or" => Ok(Self::LiteralOr(split_literals(expr))),
            "iliteral_or" => Ok(Self::ILiteralOr(split_literals_lower(expr))),
            "not_literal_or" => Ok(Self::NotLiteralOr(split_literals(expr))),
            "not_iliteral_or" => Ok(Self::NotILiteralOr(split_literals_lower(expr))),
            "wildcard" => Ok(Self::Wildcard(glob_regex(expr, false)?)),
            "iwildcard" => Ok(Self::IWildcard(glob_regex(expr, true)?)),
            "regexp" => Ok(Self::Regexp(anchored_regex(expr)?)),
            other => Err(QueryError::InvalidFilter(format!(
                "unknown filter type '{}'",
                other
            ))),
        }
    }

    /// Infer a predicate from an inline tag value
    ///
    /// Long forms (`wildcard(...)` etc.) are honored; otherwise a bare value
    /// containing `*` becomes a case-insensitive wildcard and anything else a
    /// literal-or.
    pub fn from_tag_value(value: &str) -> Result<Self, QueryError> {
        if let Some((kind, expr)) = split_long_form(value) {
            return Self::parse(kind, expr);
        }
        if value.contains('*') {
            Ok(Self::IWildcard(glob_regex(value, true)?))
        } else {
            Ok(Self::LiteralOr(split_literals(value)))
        }
    }

    /// Evaluate the predicate against a tag value
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::LiteralOr(set) => set.iter().any(|v| v == value),
            Self::ILiteralOr(set) => {
                let value = value.to_lowercase();
                set.iter().any(|v| *v == value)
            }
            Self::NotLiteralOr(set) => !set.iter().any(|v| v == value),
            Self::NotILiteralOr(set) => {
                let value = value.to_lowercase();
                !set.iter().any(|v| *v == value)
            }
            Self::Wildcard(re) | Self::IWildcard(re) | Self::Regexp(re) => re.is_match(value),
        }
    }

    /// Whether this is a plain literal-or, the only kind where the forward
    /// index-scan strategy is always at least as cheap as the backward one
    pub fn is_literal_or(&self) -> bool {
        matches!(self, Self::LiteralOr(_))
    }
}

/// A filter bound to a tag key, as used by the query pipeline
#[derive(Debug, Clone)]
pub struct QueryFilter {
    /// The tag key the predicate applies to
    pub key: String,
    /// The value predicate
    pub predicate: TagPredicate,
    /// Whether this key is a grouping axis
    pub group_by: bool,
}

impl QueryFilter {
    /// Create a filter over a key
    pub fn new(key: impl Into<String>, predicate: TagPredicate, group_by: bool) -> Self {
        Self {
            key: key.into(),
            predicate,
            group_by,
        }
    }
}

fn split_literals(expr: &str) -> Vec<String> {
    expr.split('|').map(|v| v.to_string()).collect()
}

fn split_literals_lower(expr: &str) -> Vec<String> {
    expr.split('|').map(|v| v.to_lowercase()).collect()
}

/// Recognize `kind(expr)` where `kind` is one of the known filter names
fn split_long_form(value: &str) -> Option<(&str, &str)> {
    let open = value.find('(')?;
    if !value.ends_with(')') {
        return None;
    }
    let kind = &value[..open];
    let known = matches!(
        kind,
        "literal_or"
            | "iliteral_or"
            | "not_literal_or"
            | "not_iliteral_or"
            | "wildcard"
            | "iwildcard"
            | "regexp"
    );
    known.then(|| (kind, &value[open + 1..value.len() - 1]))
}

/// Translate a glob into an anchored regex (`*` -> `.*`)
fn glob_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, QueryError> {
    let parts: Vec<String> = pattern.split('*').map(|p| regex::escape(p)).collect();
    let mut re = String::with_capacity(pattern.len() + 8);
    if case_insensitive {
        re.push_str("(?i)");
    }
    re.push('^');
    re.push_str(&parts.join(".*"));
    re.push('$');
    Regex::new(&re).map_err(|e| QueryError::InvalidFilter(e.to_string()))
}

fn anchored_regex(pattern: &str) -> Result<Regex, QueryError> {
    let anchored = format!("^(?:{})$", pattern);
    Regex::new(&anchored).map_err(|e| QueryError::InvalidFilter(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_or() {
        let f = TagPredicate::parse("literal_or", "a|b").unwrap();
        assert!(f.matches("a"));
        assert!(f.matches("b"));
        assert!(!f.matches("c"));
        assert!(!f.matches("A"));
    }

    #[test]
    fn test_not_literal_or_is_negation() {
        let yes = TagPredicate::parse("literal_or", "a|b").unwrap();
        let no = TagPredicate::parse("not_literal_or", "a|b").unwrap();
        for value in ["a", "b", "c", ""] {
            assert_eq!(yes.matches(value), !no.matches(value));
        }
    }

    #[test]
    fn test_case_insensitive_literals() {
        let f = TagPredicate::parse("iliteral_or", "Web1|WEB2").unwrap();
        assert!(f.matches("web1"));
        assert!(f.matches("Web2"));
        assert!(!f.matches("web3"));

        let n = TagPredicate::parse("not_iliteral_or", "Web1").unwrap();
        assert!(!n.matches("WEB1"));
        assert!(n.matches("web2"));
    }

    #[test]
    fn test_wildcard() {
        let f = TagPredicate::parse("wildcard", "web*").unwrap();
        assert!(f.matches("web1"));
        assert!(f.matches("web"));
        assert!(!f.matches("Web1"));
        assert!(!f.matches("db1"));

        let i = TagPredicate::parse("iwildcard", "web*").unwrap();
        assert!(i.matches("WEB1"));
    }

    #[test]
    fn test_wildcard_escapes_regex_metacharacters() {
        let f = TagPredicate::parse("wildcard", "a.b*").unwrap();
        assert!(f.matches("a.b1"));
        assert!(!f.matches("axb1"));
    }

    #[test]
    fn test_wildcard_infix() {
        let f = TagPredicate::parse("wildcard", "*east*").unwrap();
        assert!(f.matches("us-east-1"));
        assert!(!f.matches("us-west-1"));
    }

    #[test]
    fn test_regexp_is_anchored() {
        let f = TagPredicate::parse("regexp", "web[0-9]").unwrap();
        assert!(f.matches("web1"));
        assert!(!f.matches("web12"));
        assert!(!f.matches("xweb1"));
    }

    #[test]
    fn test_regexp_rejects_invalid_pattern() {
        assert!(TagPredicate::parse("regexp", "web[").is_err());
    }

    #[test]
    fn test_inline_bare_value_is_literal() {
        let f = TagPredicate::from_tag_value("a|b").unwrap();
        assert!(matches!(f, TagPredicate::LiteralOr(_)));
        assert!(f.matches("a"));
    }

    #[test]
    fn test_inline_star_is_iwildcard() {
        let f = TagPredicate::from_tag_value("web*").unwrap();
        assert!(matches!(f, TagPredicate::IWildcard(_)));
        assert!(f.matches("WEB7"));
    }

    #[test]
    fn test_inline_long_form() {
        let f = TagPredicate::from_tag_value("regexp(web[0-9]+)").unwrap();
        assert!(f.matches("web42"));
        assert!(!f.matches("web"));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(TagPredicate::parse("fuzzy", "x").is_err());
    }
}
