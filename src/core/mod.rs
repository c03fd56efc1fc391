// SerialCollect - core/mod.rs
//
// Core pipeline logic: data model, line framing, parsing, the custom
// expression language, rules and export templates.
// Must NOT depend on: app, platform, or any device/file I/O.

pub mod expr;
pub mod framer;
pub mod model;
pub mod parser;
pub mod rules;
pub mod template;
