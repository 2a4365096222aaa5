//! HTTP server

pub mod http;

pub use http::run;
