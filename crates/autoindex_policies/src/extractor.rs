//! Facet extractors.
//!
//! Retention and indexing share one matcher; an extractor picks which facet's
//! max age and intermediate-commit flag the matcher honors.

use autoindex_protocol::ConfigurationPolicy;
use chrono::Duration;

/// The facet values a matcher evaluation runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FacetLimits {
    /// `None` means no age limit.
    pub max_age: Option<Duration>,
    pub include_intermediate_commits: bool,
}

pub trait Extractor: Send + Sync {
    fn extract(&self, policy: &ConfigurationPolicy) -> FacetLimits;
}

/// Always `(None, false)`: pattern matching only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExtractor;

/// Max age of retained uploads and `retain_intermediate_commits`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionExtractor;

/// Max age of an auto-indexable commit and `index_intermediate_commits`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexingExtractor;

impl Extractor for NoopExtractor {
    fn extract(&self, _policy: &ConfigurationPolicy) -> FacetLimits {
        FacetLimits::default()
    }
}

impl Extractor for RetentionExtractor {
    fn extract(&self, policy: &ConfigurationPolicy) -> FacetLimits {
        FacetLimits {
            max_age: policy.retention_max_age(),
            include_intermediate_commits: policy.retain_intermediate_commits,
        }
    }
}

impl Extractor for IndexingExtractor {
    fn extract(&self, policy: &ConfigurationPolicy) -> FacetLimits {
        FacetLimits {
            max_age: policy.index_max_age(),
            include_intermediate_commits: policy.index_intermediate_commits,
        }
    }
}

impl<F> Extractor for F
where
    F: Fn(&ConfigurationPolicy) -> FacetLimits + Send + Sync,
{
    fn extract(&self, policy: &ConfigurationPolicy) -> FacetLimits {
        self(policy)
    }
}

static NOOP: NoopExtractor = NoopExtractor;
static RETENTION: RetentionExtractor = RetentionExtractor;
static INDEXING: IndexingExtractor = IndexingExtractor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facet {
    Retention,
    Indexing,
}

impl Facet {
    pub fn as_str(&self) -> &'static str {
        match self {
            Facet::Retention => "retention",
            Facet::Indexing => "indexing",
        }
    }

    pub fn is_enabled(&self, policy: &ConfigurationPolicy) -> bool {
        match self {
            Facet::Retention => policy.retention_enabled,
            Facet::Indexing => policy.indexing_enabled,
        }
    }

    /// The facet's extractor, or the no-op one when the facet is disabled.
    pub fn extractor_for(&self, policy: &ConfigurationPolicy) -> &'static dyn Extractor {
        match (self, self.is_enabled(policy)) {
            (_, false) => &NOOP,
            (Facet::Retention, true) => &RETENTION,
            (Facet::Indexing, true) => &INDEXING,
        }
    }
}
