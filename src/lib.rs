pub mod config;
pub mod director;

pub use config::GatewayConfig;
pub use director::GatewayDirector;
