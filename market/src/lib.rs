pub mod classifier;
pub mod coins;
pub mod config;
pub mod gateway;
pub mod liquidity;
pub mod types;
pub mod window;
