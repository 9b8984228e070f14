#![forbid(unsafe_code)]
//! Asynchronous 9P2000/9P2000.u filesystem server library for Rust.
//!
//! This crate provides a tokio-based async implementation of the server side
//! of 9P2000, the file protocol of the Plan 9 distributed operating system,
//! including the 9P2000.u extension (numeric user ids, an `ecode` field on
//! error replies, and special-file extension strings).
//!
//! # Overview
//!
//! A 9P server exposes a hierarchical file tree to remote clients over any
//! stream transport. Clients navigate the tree with fids, client-chosen
//! 32-bit handles naming positions in the tree, and perform opens, reads,
//! writes, and metadata operations through a compact binary RPC.
//!
//! The session engine in [`srv`] owns the protocol's lifecycle contracts:
//! the per-connection fid table, message-size negotiation, flush chains and
//! request cancellation, and the connection reset a renewed `Tversion`
//! triggers. File providers implement the [`srv::Filesystem`] trait and are
//! handed requests only after those protocol checks have passed.
//!
//! # Getting Started
//!
//! To serve a filesystem, you need to:
//!
//! 1. Define a type for your per-fid state (or use `()` for stateless fids)
//! 2. Implement the [`srv::Filesystem`] trait for your filesystem type
//! 3. Start the server with [`srv::srv_async`], or hand connected streams to
//!    [`srv::Srv::dispatch`] from your own accept loop
//!
//! For synthetic filesystems (control files, status trees), the [`tree`]
//! module serves an in-memory hierarchy of nodes with per-node operation
//! tables behind the same trait.
//!
//! # Message Flow
//!
//! 1. **Version negotiation**: `Tversion` picks the protocol variant and
//!    message size, and resets any previous state of the connection
//! 2. **Authentication** (optional): `Tauth`/`Rauth` exchange over an
//!    auth-typed fid, driven by a pluggable [`srv::AuthOps`] provider
//! 3. **Attach**: `Tattach` binds a fid to the tree root
//! 4. **Operations**: `walk`, `open`, `create`, `read`, `write`, `stat`...
//! 5. **Cleanup**: `Tclunk` releases fids; `Tflush` abandons slow requests
//!
//! # Fid Invariants
//!
//! - Each fid is unique per connection; reusing a live fid value fails with
//!   "fid already exists"
//! - An open fid cannot be opened again or used as a walk source
//! - Directory reads must resume at the accumulated offset (or restart at
//!   zero); anything else fails with "bad offset in directory read"
//! - After `Tclunk` or `Tremove` the fid is gone, whatever the outcome
//!
//! # Error Handling
//!
//! Handlers return [`error::Error`], a Plan 9 error string paired with the
//! errno that 9P2000.u clients receive in `Rerror.ecode`. The canonical
//! taxonomy lives as constants on the type; OS errors convert with their
//! strerror text. Memory-exhaustion errors are answered from a reply the
//! server preallocates at startup.
//!
//! # Transport
//!
//! Dial strings name the transport: `"tcp!0.0.0.0!564"` or
//! `"unix!/tmp/sock"`. Anything that yields an `AsyncRead`/`AsyncWrite`
//! pair can be served directly through [`srv::Srv::dispatch`].
//!
//! The server is written for cooperative single-threaded operation: run it
//! on a `current_thread` tokio runtime and every request is handled as a
//! task on the one loop, pipelined but never parallel.
pub mod error;
pub mod fcall;
pub mod serialize;
pub mod srv;
pub mod tree;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::utils::Result;
