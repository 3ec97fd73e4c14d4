//! gridmux-frame: codec for the line-oriented upstream feed protocol
//!
//! Frames are STOMP-like: a command line, `key:value` header lines, a blank
//! line, an optional body, and a NUL terminator. Malformed input decodes to
//! `None` so protocol noise can be dropped without touching the dispatcher.

pub mod frame;

pub use frame::{Command, Frame};
