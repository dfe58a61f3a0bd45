pub mod commands;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod history;
pub mod ingest;
pub mod liveness;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod notifier;
pub mod realtime;
pub mod registry;
pub mod rest;
pub mod storage;
pub mod validate;
