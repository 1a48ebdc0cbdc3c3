//! modkern: a microkernel for content-addressed modules.
//!
//! Loads untrusted modules, named by content or resolver identifiers, into
//! isolated sandboxes and routes correlated query, update and response frames
//! between callers and those sandboxes.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credential;
pub mod frame;
pub mod identifier;
pub mod logging;

pub mod host;
pub mod registry;

pub mod kernel;
