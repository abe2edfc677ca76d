pub mod agent;
pub mod config;
pub mod context;
pub mod cta;
pub mod durable;
pub mod errors;
pub mod factory;
pub mod gates;
pub mod implement;
pub mod logging;
pub mod phases;
pub mod review;
pub mod test_support;
