//! Content hashing for sandbox cache invalidation.

use fathom_types::PipelineBundle;
use sha2::{Digest, Sha256};

/// Compute the cache key for a pipeline's compiled sandbox.
///
/// Digest of [`PipelineBundle::fingerprint`]: every referenced `code_hash`
/// in declaration order, the pipeline's `updated_at` and its `version`.
/// Reordering functions changes the hash.
pub fn content_hash(bundle: &PipelineBundle) -> String {
    let (hashes, updated_at, version) = bundle.fingerprint();
    let mut hasher = Sha256::new();
    for (id, code_hash) in hashes {
        hasher.update(id.as_bytes());
        hasher.update([0]);
        hasher.update(code_hash.as_bytes());
        hasher.update([b'\n']);
    }
    hasher.update(updated_at.to_rfc3339().as_bytes());
    hasher.update([0]);
    hasher.update(version.to_le_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use fathom_types::{FunctionConfig, PipelineSpec};

    fn bundle(functions: &[(&str, &str)]) -> PipelineBundle {
        let updated_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let spec = PipelineSpec::new(
            "pb1",
            "ws1",
            1,
            functions.iter().map(|(id, _)| id.to_string()).collect(),
            updated_at,
        );
        let functions = functions
            .iter()
            .map(|(id, hash)| FunctionConfig::new(*id, *id, "", *hash, "ws1"))
            .collect();
        PipelineBundle::new(spec, functions)
    }

    #[test]
    fn test_stable_for_same_input() {
        let a = bundle(&[("f1", "h1")]);
        assert_eq!(content_hash(&a), content_hash(&a.clone()));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[test]
    fn test_equal_fingerprints_hash_equal() {
        let a = bundle(&[("f1", "h1")]);
        let mut renamed = a.clone();
        renamed.functions[0].name = "renamed".into();
        renamed.functions[0].code = "export default () => 2".into();
        assert_eq!(a.fingerprint(), renamed.fingerprint());
        assert_eq!(content_hash(&a), content_hash(&renamed));
    }

    #[test]
    fn test_code_hash_change() {
        assert_ne!(
            content_hash(&bundle(&[("f1", "h1")])),
            content_hash(&bundle(&[("f1", "h2")]))
        );
    }

    #[test]
    fn test_reorder_changes_hash() {
        assert_ne!(
            content_hash(&bundle(&[("f1", "h1"), ("f2", "h2")])),
            content_hash(&bundle(&[("f2", "h2"), ("f1", "h1")]))
        );
    }

    #[test]
    fn test_updated_at_and_version_change_hash() {
        let base = bundle(&[("f1", "h1")]);
        let mut touched = base.clone();
        touched.spec.updated_at = touched.spec.updated_at + Duration::seconds(1);
        let mut bumped = base.clone();
        bumped.spec.version += 1;

        assert_ne!(content_hash(&base), content_hash(&touched));
        assert_ne!(content_hash(&base), content_hash(&bumped));
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        assert_ne!(
            content_hash(&bundle(&[("f1", "h1h")])),
            content_hash(&bundle(&[("f1h", "1h")]))
        );
    }
}
