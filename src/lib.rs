pub mod advertising;
pub mod config;
pub mod error;
pub mod extractor;
pub mod routes;

pub use advertising::AdvertisingContext;
pub use config::{advertising_config_from_env, AdvertisingConfig, PackagePrices};
pub use routes::api_routes;
