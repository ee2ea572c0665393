//! Core supervision engine for the SiegeUp host agent.
//!
//! The engine reconciles a persisted set of desired game servers (keyed by
//! TCP port) against the child processes actually running on this host. All
//! mutable runtime state lives on a single owning task (see [`supervisor`]);
//! callers interact with it through a command channel, which serializes
//! per-port lifecycle transitions without locks.

pub mod builds;
pub mod logs;
pub mod port;
pub mod process;
pub mod settings;
pub mod supervisor;
