//! Glob helpers for ref names and repository names.

use globset::{GlobBuilder, GlobMatcher};

use crate::error::{PolicyError, Result};

/// Pattern on a `tree` policy that selects the default branch.
pub const DEFAULT_BRANCH_PATTERN: &str = "HEAD";

/// Compile a glob over ref or repository names.
///
/// `*` crosses `/`, so `feature/*` and `github.com/acme/*` behave the way
/// policy authors write them.
pub fn compile(pattern: &str) -> Result<GlobMatcher> {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return Err(PolicyError::invalid_pattern(pattern, "pattern is empty"));
    }
    GlobBuilder::new(trimmed)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|err| PolicyError::invalid_pattern(pattern, err.kind().to_string()))
}

/// Compile every pattern, failing on the first malformed one.
pub fn compile_all(patterns: &[String]) -> Result<Vec<GlobMatcher>> {
    patterns.iter().map(|p| compile(p)).collect()
}

/// Match a raw pattern against a name.
pub fn matches(pattern: &str, name: &str) -> Result<bool> {
    Ok(compile(pattern)?.is_match(name))
}
