//! Outage Harvest - historical archive builder for tile-based outage maps
//!
//! This library provides the scraping, normalization and storage pipeline.
//! It exposes all modules for testing purposes.

pub mod entities;
pub mod errors;
pub mod fetch;
pub mod geometry;
pub mod harvest;
pub mod normalize;
pub mod settings;
pub mod storage;
pub mod traversal;
