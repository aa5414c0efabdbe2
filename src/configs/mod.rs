pub mod base;
pub mod cache;
pub mod catalog;
pub mod logging;
pub mod pool;
pub mod reader;
pub mod server;

pub use base::*;
pub use cache::*;
pub use catalog::*;
pub use logging::*;
pub use pool::*;
pub use reader::*;
pub use server::*;
