//! Compiled glob/regex patterns.
//!
//! Every pattern in the rule tables is compiled once, at configuration load,
//! into a [`PatternMatcher`]. Matching is then a pure predicate that cannot
//! fail at request time.
//!
//! | Syntax | Kind | Semantics |
//! |--------|------|-----------|
//! | `*@company.com` | glob | whole-string, case-insensitive (`*`, `?`, `[..]`) |
//! | `regex:^proj-` | regex | unanchored unless the pattern anchors itself |
//! | `/^proj-/` | regex | same as `regex:` |

use std::fmt;

use glob::{MatchOptions, Pattern};
use regex::Regex;

use crate::{Error, Result};

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A pattern compiled once and matched many times.
#[derive(Clone)]
pub enum PatternMatcher {
    /// Shell-style glob, matched against the whole input.
    Glob(Pattern),
    /// Regular expression, matched anywhere in the input.
    Regex(Regex),
}

impl PatternMatcher {
    /// Compile a glob pattern.
    pub fn glob(pattern: &str) -> Result<Self> {
        Pattern::new(pattern)
            .map(Self::Glob)
            .map_err(|e| Error::Config(format!("Invalid glob pattern '{pattern}': {e}")))
    }

    /// Compile a regular expression.
    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|e| Error::Config(format!("Invalid regex pattern '{pattern}': {e}")))
    }

    /// Compile a pattern written in the rule-table notation.
    ///
    /// `regex:<re>` and `/<re>/` select a regex; anything else is a glob.
    pub fn parse(pattern: &str) -> Result<Self> {
        if let Some(re) = pattern.strip_prefix("regex:") {
            return Self::regex(re);
        }
        if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
            return Self::regex(&pattern[1..pattern.len() - 1]);
        }
        Self::glob(pattern)
    }

    /// Returns `true` if `input` matches.
    #[must_use]
    pub fn matches(&self, input: &str) -> bool {
        match self {
            Self::Glob(p) => p.matches_with(input, GLOB_OPTIONS),
            Self::Regex(re) => re.is_match(input),
        }
    }

    /// The source text of the pattern.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Glob(p) => p.as_str(),
            Self::Regex(re) => re.as_str(),
        }
    }
}

impl fmt::Debug for PatternMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Glob(p) => write!(f, "Glob({:?})", p.as_str()),
            Self::Regex(re) => write!(f, "Regex({:?})", re.as_str()),
        }
    }
}

/// Compile a list of patterns, failing on the first invalid entry.
pub fn compile_all<F>(patterns: &[String], compile: F) -> Result<Vec<PatternMatcher>>
where
    F: Fn(&str) -> Result<PatternMatcher>,
{
    patterns.iter().map(|p| compile(p)).collect()
}

/// Returns `true` if any matcher accepts `input`.
#[must_use]
pub fn any_matches(matchers: &[PatternMatcher], input: &str) -> bool {
    matchers.iter().any(|m| m.matches(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_whole_string_case_insensitively() {
        let m = PatternMatcher::glob("*@company.com").unwrap();

        assert!(m.matches("alice@company.com"));
        assert!(m.matches("Bob@Company.COM"));
        assert!(!m.matches("alice@company.com.evil.io"));
    }

    #[test]
    fn glob_question_mark_matches_single_char() {
        let m = PatternMatcher::glob("user-?").unwrap();

        assert!(m.matches("user-1"));
        assert!(!m.matches("user-12"));
    }

    #[test]
    fn regex_is_unanchored() {
        let m = PatternMatcher::regex("proj").unwrap();

        assert!(m.matches("my-proj-1"));
        assert!(!m.matches("other"));
    }

    #[test]
    fn anchored_regex_matches_full_key_only() {
        let m = PatternMatcher::regex("^proj-[0-9]+$").unwrap();

        assert!(m.matches("proj-42"));
        assert!(!m.matches("xproj-42"));
    }

    #[test]
    fn parse_selects_kind_from_notation() {
        assert!(matches!(PatternMatcher::parse("regex:^a").unwrap(), PatternMatcher::Regex(_)));
        assert!(matches!(PatternMatcher::parse("/^a/").unwrap(), PatternMatcher::Regex(_)));
        assert!(matches!(PatternMatcher::parse("a*").unwrap(), PatternMatcher::Glob(_)));
    }

    #[test]
    fn invalid_patterns_fail_at_compile_time() {
        assert!(matches!(PatternMatcher::regex("(unclosed"), Err(Error::Config(_))));
        assert!(matches!(PatternMatcher::glob("[unclosed"), Err(Error::Config(_))));
    }

    #[test]
    fn compile_all_reports_first_bad_entry() {
        let patterns = vec!["ok".to_string(), "(bad".to_string()];

        let err = compile_all(&patterns, PatternMatcher::regex).unwrap_err();

        assert!(err.to_string().contains("(bad"));
    }
}
