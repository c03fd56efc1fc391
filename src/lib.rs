// SerialCollect - lib.rs
//
// Library entry point, exposing the collection pipeline for the CLI in
// `main.rs`, for integration testing and for programmatic use.

pub mod app;
pub mod core;
pub mod platform;
pub mod util;
