#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! vibetunnel library — the server-side session substrate.
//!
//! Building blocks:
//! - `io_loop` — readiness loop (epoll/kqueue via mio, select fallback)
//! - `pty` — PTY spawning and per-session byte bridging
//! - `sessions` — session registry, lifecycle, and recordings
//! - `control` — on-disk control directory and its watcher
//! - `term` — headless terminal screen model and binary snapshots
//! - `routes` — REST API handlers
//! - `ws` — the `/buffers` WebSocket hub
//! - `hq` — federation (remote registry, forwarding, aggregation)
//! - `auth` — bearer-token middleware and bypass policy

pub mod auth;
pub mod config;
pub mod control;
pub mod error;
pub mod hq;
pub mod io_loop;
pub mod pty;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod term;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::AuthPolicy;
pub use config::Config;
pub use error::{ApiError, SessionError};
pub use sessions::SessionManager;
pub use state::AppState;
