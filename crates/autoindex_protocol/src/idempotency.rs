//! Coalescing keys for index records.

use crate::types::IndexJobSpec;
use blake3::Hasher;

const SEP: u8 = 0x1f;

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Where the job spec behind a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationSource {
    /// Produced by the inference engine
    Inferred,
    /// Stored per-repository configuration
    Stored,
    /// Explicit override text on a manual request
    Override,
}

impl ConfigurationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigurationSource::Inferred => "auto",
            ConfigurationSource::Stored => "stored",
            ConfigurationSource::Override => "override",
        }
    }
}

/// Stable coalescing key for one job spec.
///
/// Components:
/// - configuration source
/// - canonical JSON of the spec
///
/// Two specs that serialize identically share a key, so re-inferring the same
/// job for the same commit coalesces with the pending record.
pub fn configuration_key(source: ConfigurationSource, spec: &IndexJobSpec) -> String {
    let json = serde_json::to_string(spec).unwrap_or_default();
    let digest = hash_parts(&[source.as_str(), json.as_str()]);
    format!("{}:{}", source.as_str(), &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(indexer: &str) -> IndexJobSpec {
        IndexJobSpec {
            indexer: indexer.to_string(),
            steps: vec![],
            indexer_args: vec![],
            root: String::new(),
            outfile: String::new(),
            local_steps: vec![],
            requested_env_vars: vec![],
        }
    }

    #[test]
    fn test_key_is_stable_and_prefixed() {
        let a = configuration_key(ConfigurationSource::Inferred, &spec("scip-go"));
        let b = configuration_key(ConfigurationSource::Inferred, &spec("scip-go"));
        assert_eq!(a, b);
        assert!(a.starts_with("auto:"));
        assert_eq!(a.len(), "auto:".len() + 16);
    }

    #[test]
    fn test_key_distinguishes_spec_and_source() {
        let inferred = configuration_key(ConfigurationSource::Inferred, &spec("scip-go"));
        let stored = configuration_key(ConfigurationSource::Stored, &spec("scip-go"));
        let other = configuration_key(ConfigurationSource::Inferred, &spec("scip-java"));
        assert_ne!(inferred, stored);
        assert_ne!(inferred, other);
    }
}
