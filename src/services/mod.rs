pub mod admission;
pub mod command;
pub mod discovery;
pub mod events;
pub mod insight_service;
pub mod notifications;
pub mod parser;
pub mod scan_service;
pub mod supervisor;

#[cfg(test)]
pub mod test_support;

pub use events::{EventBus, ScanEvent};
pub use scan_service::ScanService;
