#![allow(dead_code)]

pub mod builders;
pub mod db;
pub mod feed;

pub use builders::{
    cluster_record, desc, settings, single_record, t0, tile_body, tile_center, tile_url, ANCHOR,
    NEIGHBOR,
};
pub use db::{seed_job, TestDb};
pub use feed::ScriptedFeed;
