pub mod catalog;
pub mod config;
pub mod coverage;
pub mod engine;
pub mod errors;
pub mod fingerprint;
pub mod model;
pub mod providers;
pub mod report;
pub mod storage;
