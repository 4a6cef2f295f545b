//! Public API clients
//!
//! This module provides:
//! - [`ResourceApi`] - the remote API seam and its [`ApiError`] taxonomy
//! - [`ClientHandle`] - a connection plus its adaptive throttle state
//! - [`ClientPool`] - leases handles to workers, renewing lazy sessions on the way out
//! - [`ScriptedApi`] - in-memory API for tests
//!
//! # Throttling
//!
//! ```text
//!           success: interval -= dec (floor 0)
//!   ┌──────────────────────────────────────────────┐
//!   ▼                                              │
//! ┌────────┐  429, interval <= threshold  ┌──────────────┐
//! │ steady │ ───────────────────────────► │ interval+inc │
//! └────────┘                              └──────────────┘
//!   ▲                                              │
//!   │   429, interval > threshold: clear cookies   │
//!   └──────────────── interval = 0 ◄───────────────┘
//! ```

mod api;
mod handle;
mod pool;
mod scripted;

pub use api::{ApiError, ResourceApi, TOO_MANY_REQUESTS};
pub use handle::{CallOutcome, ClientHandle, ClientStats, ThrottleAdjustment, ThrottleSteps};
pub use pool::ClientPool;
pub use scripted::ScriptedApi;
