// Trigger scheduling and job execution engine shared by the daemon and tests

pub mod broker;
pub mod config;
pub mod db;
pub mod errors;
pub mod feed;
pub mod models;
pub mod notifier;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod trigger;
pub mod worker;
