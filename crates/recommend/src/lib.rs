//! Item-based collaborative-filtering recommender.
//!
//! Hybrid similarity: cosine over the user-course interaction matrix blended
//! with course attribute similarity, with a popularity fallback for cold
//! starts and under-filled result sets. Pure in-memory scoring — callers
//! aggregate the behavior log and fetch the catalogue.

pub mod matrix;
pub mod scoring;

pub use matrix::UserItemMatrix;
pub use scoring::{
    attribute_similarity, BehaviorAggregate, CourseAttributes, Recommendation, RecommendReason,
    Recommender,
};
