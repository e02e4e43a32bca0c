//! resio - handle-based OS resources for a single-threaded runtime
//!
//! Every OS object a program touches (files, sockets, TLS streams, listeners,
//! filesystem watches, signal bindings, child processes) lives in a
//! [`ResourceTable`](table::ResourceTable) and is reached only through an
//! integer [`Handle`]. Work on those objects is expressed as named operations
//! that are dispatched either synchronously or as futures driven by the
//! [`Runtime`].
//!
//! # Layers
//!
//! - **Errors**: every OS failure is classified into one of a fixed set of
//!   [`ErrorKind`]s
//! - **Resource table**: monotonic, never-reused handles; close is immediate
//!   and interrupts every pending op that references the handle
//! - **Dispatcher**: [`Op`] values run through [`Runtime::dispatch_sync`] or
//!   [`Runtime::dispatch_async`], with optional cancel handles
//! - **Poll loops**: [`SignalListeners`] and [`FsWatcher`] keep one poll in
//!   flight per handle and end cleanly on close
//! - **Streams**: TCP listeners and sockets, optionally upgraded to TLS with an
//!   explicit handshake
//!
//! # Example
//!
//! ```no_run
//! use resio::{Op, OpValue, Runtime};
//! use resio::ops::fs::OpenOptions;
//!
//! let rt = Runtime::new().unwrap();
//! let rid = rt
//!     .dispatch_sync(Op::OpenSync {
//!         path: "/etc/hostname".into(),
//!         options: OpenOptions::new().read(true),
//!     })
//!     .and_then(OpValue::into_handle)
//!     .unwrap();
//!
//! let contents = rt.block_on(resio::io::read_to_end(&rt, rid)).unwrap();
//! println!("{}", String::from_utf8_lossy(&contents));
//! rt.dispatch_sync(Op::Close { rid }).unwrap();
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod io;
pub mod ops;
pub mod poll_loop;
pub mod runtime;
pub mod table;

pub use config::{ConfigError, RuntimeConfig};
pub use dispatch::{Op, OpDecl, OpFuture, OpMode, OpValue};
pub use error::{ErrorKind, OpError, OpResult};
pub use poll_loop::{FsWatcher, ListenerId, SignalListeners};
pub use runtime::{JoinHandle, Runtime, RuntimeStats};
pub use table::{Handle, ResourceKind, ResourceState};
