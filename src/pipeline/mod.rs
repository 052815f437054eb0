//! Pipeline model
//!
//! A [`Pipeline`] is an immutable list of parsed [`Stage`]s. Each stage keeps
//! the JSON it was parsed from; the staged tier hashes those specs to name
//! its temporary relations.

pub mod context;
pub mod filter;
pub mod parser;
pub mod stage;

pub use context::{FieldOrigin, PipelineContext, Row};
pub use filter::{FilterExpr, Predicate, RangeOp, TextMatches};
pub use parser::{parse_pipeline, parse_stage};
pub use stage::{
    Accumulator, AccumulatorOp, GroupSpec, LookupSpec, ProjectField, ProjectMode, ProjectSpec,
    SortDirection, Stage, StageKind, UnwindSpec,
};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::AggregationResult;

/// An ordered list of stages
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Creates a pipeline from parsed stages
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Parses a JSON array of stages
    pub fn from_json(value: &Value) -> AggregationResult<Self> {
        parse_pipeline(value)
    }

    /// Parses pipeline JSON text
    pub fn from_json_str(text: &str) -> AggregationResult<Self> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            crate::errors::AggregationError::invalid_pipeline(format!("pipeline JSON: {}", e))
        })?;
        Self::from_json(&value)
    }

    /// Stages in execution order
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True when the pipeline has no stages
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The original JSON form
    pub fn to_json(&self) -> Value {
        Value::Array(self.stages.iter().map(|s| s.spec.clone()).collect())
    }

    /// Hex SHA-256 of the specs of the first `n` stages
    pub fn prefix_hash(&self, n: usize) -> String {
        let mut hasher = Sha256::new();
        for stage in self.stages.iter().take(n) {
            hasher.update(stage.spec.to_string().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}
