// Worker handlers and the pool executing them

pub mod handler;
pub mod pool;

pub use handler::{handler_fn, HandlerRegistry, WorkerContext, WorkerHandler, WorkerSettings};
pub use pool::WorkerPool;
