//! aeropipe - Document aggregation pipelines on an embedded SQL engine
//!
//! A pipeline runs on the fastest tier that can reproduce it exactly:
//! a single chained-CTE statement, temporary relations with in-memory steps
//! for what SQL cannot express, or the in-memory interpreter.
//!
//! ```ignore
//! use aeropipe::{Aggregator, ExecutionOptions, SqliteStore};
//! use serde_json::json;
//!
//! let store = SqliteStore::open_in_memory()?;
//! store.insert("orders", &json!({"item": "a", "qty": 2}))?;
//! let docs = Aggregator::new(&store)
//!     .aggregate_json("orders", &json!([{"$match": {"qty": {"$gt": 1}}}]), &ExecutionOptions::default())?
//!     .into_vec();
//! ```

pub mod aggregator;
pub mod compiler;
pub mod config;
pub mod errors;
pub mod expression;
pub mod interpreter;
pub mod observability;
pub mod optimizer;
pub mod pipeline;
pub mod staged;
pub mod stages;
pub mod storage;
pub mod stream;
pub mod value;

pub use aggregator::{Aggregator, Tier};
pub use config::ExecutionOptions;
pub use errors::{AggregationError, AggregationErrorCode, AggregationResult, TierError};
pub use pipeline::Pipeline;
pub use storage::SqliteStore;
pub use stream::DocumentStream;
