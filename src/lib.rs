pub mod aggregator;
pub mod analyzer;
pub mod archive;
pub mod config;
pub mod enhancer;
pub mod events;
pub mod model;
pub mod normalizer;
pub mod parser;
pub mod scheduler;
pub mod scraper;
pub mod storage;
pub mod utils;
