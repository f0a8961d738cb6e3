pub mod scan_repo;

pub use scan_repo::{ScanRepository, SqlxScanRepository};
