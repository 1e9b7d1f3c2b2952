pub mod align;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod normalize;
pub mod pipeline;
pub mod sentiment;
pub mod storage;
pub mod time;
