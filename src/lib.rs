//! Postern - multi-session gateway for an end-to-end-encrypted chat network
//!
//! Postern fronts an upstream E2E-encrypted messaging network and hosts many
//! independent device-linked accounts ("sessions") in a single process.
//! HTTP callers create a session, link it to a phone by scanning a QR code,
//! and then send text or media messages through it.
//!
//! ## Core pieces
//!
//! - **Supervisor**: process-wide session registry with single-flight restore
//! - **Session**: one linked account - state machine, QR linking, logout
//! - **Transport**: capability seam over the upstream client library
//! - **Event bus**: bounded async dispatch to filtered observers
//! - **Send pipeline**: per-user rate spacing, duplicate suppression, and
//!   websocket-drop retry around every send

pub mod config;
pub mod events;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod routes;
pub mod server;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod transport;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{PosternError, Result};
