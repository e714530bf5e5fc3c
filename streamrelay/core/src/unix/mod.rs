//! Unix Collaborators
//!
//! A `poll(2)` run loop and file-descriptor streams. Lets the relay move bytes
//! between real files, pipes and terminals.

mod fd_stream;
mod run_loop;

pub use fd_stream::{FdSink, FdSource};
pub use run_loop::PollRunLoop;
