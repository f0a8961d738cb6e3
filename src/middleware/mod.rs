pub mod cors;
pub mod logging;

pub use cors::create_cors_layer;
pub use logging::{create_logging_layer, init_logging, request_logging_middleware};
