// ================
// common/src/lib.rs
// ================
//! Common wire-protocol definitions
//! shared between roomhub clients and the server.
//! This crate defines the method tag assignments, the method-class
//! predicates, and the length-prefixed binary frame codec.

pub mod frame;
pub mod method;

pub use frame::{Frame, FrameError};
