pub mod host;
pub mod insight;
pub mod scan;

pub use host::*;
pub use insight::*;
pub use scan::*;
