//! Bunch AI Common Library
//!
//! CLIとワーカーで共有される型と純粋な処理（正規化・集計・マージ）

pub mod types;
pub mod alias;
pub mod error;
pub mod parser;
pub mod aggregate;
pub mod merge;

pub use types::{
    empty_counts, BoundingBox, Category, CategoryCounts, CategoryStat, CategorySummary, ConsolidatedResult,
    Detection, ErrorKind, ImageSize, JobState, ManualClassification, PhotoError, PhotoResult,
    ProcessingStatus, SavedArtifact,
};
pub use alias::CategoryAliases;
pub use error::{Error, Result};
pub use parser::{extract_artifacts, normalize, redact_artifacts, EmbeddedArtifact, Geometry};
pub use aggregate::{summarize, Aggregator};
pub use merge::merge_results;
