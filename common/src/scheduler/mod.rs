// Scheduler: trigger registry and emission forwarding

pub mod engine;

pub use engine::Scheduler;
