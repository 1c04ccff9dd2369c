pub mod cache;
pub mod config;
pub mod geo;
pub mod mitm;
pub mod proxy;
pub mod router;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod utils;

pub use config::RootConfig;
pub use supervisor::Supervisor;
