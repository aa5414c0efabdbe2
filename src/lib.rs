pub mod backend;
pub mod cache;
pub mod catalog;
pub mod common;
pub mod configs;
pub mod fetch;
pub mod http;
pub mod mkvindex;
pub mod pool;
pub mod reader;
pub mod registry;
