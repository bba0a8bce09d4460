pub mod aggregate;
pub mod config;
pub mod correlate;
pub mod export;
pub mod session;
pub mod tracer;
