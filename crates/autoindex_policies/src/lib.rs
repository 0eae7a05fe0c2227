//! Configuration policy matching.
//!
//! Policies select commits by repository scope plus a commit, tag or branch
//! pattern. The matcher evaluates them against the read-only git metadata
//! surface ([`GitMetadataProvider`]) and returns the commits that matter for
//! retention or auto-indexing.

pub mod error;
pub mod extractor;
pub mod git;
pub mod matcher;
pub mod metrics;
pub mod patterns;

pub use error::{PolicyError, ProviderError, ProviderResult, Result};
pub use extractor::{
    Extractor, Facet, FacetLimits, IndexingExtractor, NoopExtractor, RetentionExtractor,
};
pub use git::{GitMetadataProvider, RefDescription, RefType, Repository};
pub use matcher::{
    policy_applies_to, validate_policy, EvaluationReport, PolicyEvaluation, PolicyMatch,
    PolicyMatcher,
};
pub use metrics::METRICS;
