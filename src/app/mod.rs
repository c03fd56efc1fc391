// SerialCollect - app/mod.rs
//
// Application layer: the collection pipeline, the recording session, the
// background line source and outbound commands.
// Dependencies: core layer.
// Must NOT depend on: platform specifics.

pub mod collector;
pub mod session;
pub mod source;
pub mod writer;
