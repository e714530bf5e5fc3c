//! StreamRelay Core - Event-Driven Callbacks over Byte Streams
//!
//! This crate turns a push-style native readiness mechanism (one
//! subscription per stream, one callback, a bitmask of event codes) into
//! per-event handler sets that can be added and removed independently. On
//! top of that it provides a backpressure-aware writer and a source-to-sink
//! pipe.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         StreamPipe                               │
//! │   Readable ──▶ read chunk ──▶ BackpressureWriter ──▶ sink         │
//! │   EndOfStream ──▶ close + unschedule both ──▶ on_end             │
//! └───────────────┬─────────────────────────────┬────────────────────┘
//!                 │                             │
//! ┌───────────────▼──────────┐    ┌─────────────▼────────────────────┐
//! │     Stream<RawSource>    │    │       Stream<RawSink>            │
//! │  ┌────────────────────┐  │    │  ┌────────────────────┐          │
//! │  │  HandlerRegistry   │  │    │  │  HandlerRegistry   │          │
//! │  └─────────┬──────────┘  │    │  └─────────┬──────────┘          │
//! │  ┌─────────▼──────────┐  │    │  ┌─────────▼──────────┐          │
//! │  │ NotificationBridge │  │    │  │ NotificationBridge │          │
//! │  └─────────┬──────────┘  │    │  └─────────┬──────────┘          │
//! └────────────┼─────────────┘    └────────────┼─────────────────────┘
//!              │ one client, union of flags     │
//! ┌────────────▼───────────────────────────────▼─────────────────────┐
//! │           Notifier + Scheduler (ManualRunLoop, PollRunLoop)      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`EventType`]: the five stream events, with their native bit codes
//! - [`HandlerRegistry`]: per-stream handlers, dispatched from a snapshot
//! - [`NotificationBridge`]: keeps the native subscription equal to the
//!   registry's flag set
//! - [`Stream`]: a raw channel plus its registry and bridge
//! - [`BackpressureWriter`]: writes a whole payload, suspending on a full sink
//! - [`StreamPipe`]: relays a source into a sink until end of stream
//!
//! # Threading
//!
//! Everything here is single-threaded (`Rc`, `RefCell`). Handlers run on the
//! thread that pumps the run loop.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::rc::Rc;
//! use streamrelay_core::{ManualRunLoop, MemorySink, MemorySource, NativeEvent, StreamPipe};
//!
//! let run_loop = Rc::new(ManualRunLoop::new());
//! let source = run_loop.stream(MemorySource::new(vec![b"AB".to_vec(), b"C".to_vec()]));
//! let sink = run_loop.stream(MemorySink::new());
//!
//! let handle = StreamPipe::default().pipe(&source, &sink, None)?;
//! run_loop.fire(source.id(), NativeEvent::HAS_BYTES_AVAILABLE);
//! run_loop.fire(source.id(), NativeEvent::HAS_BYTES_AVAILABLE);
//! run_loop.fire(source.id(), NativeEvent::END_ENCOUNTERED);
//!
//! assert_eq!(sink.raw().received(), b"ABC");
//! assert!(handle.is_finished());
//! ```
//!
//! # Module Overview
//!
//! - [`event`]: event types, native codes and flag sets
//! - [`registry`]: handler bookkeeping and snapshot dispatch
//! - [`bridge`]: the native subscription binding
//! - [`stream`]: the stream wrapper and its collaborator traits
//! - [`writer`]: backpressure-aware writes
//! - [`pipe`]: source-to-sink relaying
//! - [`config`]: TOML, environment and CLI configuration
//! - [`memory`]: in-memory run loop and channels
//! - `unix`: `poll(2)` run loop and file-descriptor streams (Unix only)

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bridge;
pub mod config;
pub mod event;
pub mod memory;
pub mod pipe;
pub mod registry;
pub mod stream;
#[cfg(unix)]
pub mod unix;
pub mod writer;

// Event exports
pub use event::{EventFlags, EventType, NativeEvent};

// Registry and bridge exports
pub use bridge::{NativeCallback, NotificationBridge, Notifier};
pub use registry::{DispatchReport, DispatchSnapshot, Handler, HandlerId, HandlerRegistry};

// Stream exports
pub use stream::{
    RawSink, RawSource, RawStream, RunMode, Scheduler, Stream, StreamError, StreamId, StreamState,
    WeakStream,
};

// Writer and pipe exports
pub use pipe::{PipeConfig, PipeHandle, PipeOutcome, PipeSummary, StreamPipe, DEFAULT_CHUNK_SIZE};
pub use writer::{BackpressureWriter, WriteError, WriteOutcome, WriteStatus, WriterConfig};

// Collaborator exports
pub use memory::{ManualRunLoop, MemorySink, MemorySource};
#[cfg(unix)]
pub use unix::{FdSink, FdSource, PollRunLoop};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RelayConfigFile, RelayToml, RunLoopConfig,
};
