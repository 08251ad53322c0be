pub mod auth;
pub mod config;
pub mod model;
pub mod response;

pub use config::Config;
pub use model::*;
pub use response::ApiResponse;
