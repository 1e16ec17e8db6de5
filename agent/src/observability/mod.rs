pub mod logging;

pub use logging::{init_production_logging, init_simple_logging, init_worker_logging};
