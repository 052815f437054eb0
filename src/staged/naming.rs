//! Temporary relation names
//!
//! `aero_stage_<hash>_<n>`: the hash covers the stage specs processed so
//! far, so the same pipeline shape reuses the same names; `n` is a process
//! counter that keeps concurrent scopes apart.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::pipeline::Pipeline;

/// Prefix shared by every temporary relation
pub const RELATION_PREFIX: &str = "aero_stage_";

/// Hex digits of the hash kept in a name
const HASH_DIGITS: usize = 16;

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Name for the relation holding the output of the first `stages` stages
pub fn relation_name(pipeline: &Pipeline, stages: usize) -> String {
    let hash = pipeline.prefix_hash(stages);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}{}_{}", RELATION_PREFIX, &hash[..HASH_DIGITS], n)
}

/// Name for a savepoint
pub fn savepoint_name() -> String {
    format!("aero_scope_{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_names_share_hash_but_not_counter() {
        let pipeline = Pipeline::from_json(&json!([{"$limit": 1}, {"$skip": 1}])).unwrap();
        let a = relation_name(&pipeline, 1);
        let b = relation_name(&pipeline, 1);
        assert!(a.starts_with(RELATION_PREFIX));
        assert_ne!(a, b);

        let hash = |name: &str| name.rsplit_once('_').map(|(head, _)| head.to_string());
        assert_eq!(hash(&a), hash(&b));
        assert_ne!(hash(&a), hash(&relation_name(&pipeline, 2)));
    }
}
