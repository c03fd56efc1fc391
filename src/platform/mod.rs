// SerialCollect - platform/mod.rs
//
// Platform abstraction layer: configuration documents and directories.
// Dependencies: standard library, directories crate, core model types.
// Must NOT depend on: app.

pub mod config;
