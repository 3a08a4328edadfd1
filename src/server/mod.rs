//! Handshake protocol server
//!
//! - `http`: shared hyper listener and routing
//! - `websocket`: per-connection handshake state machine
//! - `admission`: bounded-concurrency ceiling with a FIFO hold queue
//! - `session`: in-flight session registry
//! - `protocol`: wire envelopes and close codes

pub mod admission;
pub mod http;
pub mod protocol;
pub mod session;
pub mod websocket;

pub use admission::{Admission, AdmissionController, AdmissionPermit};
pub use http::{run, run_with_listener, AppState};
pub use protocol::{HANDSHAKE_PATH, PROTOCOL_VERSION};
pub use session::{SessionRegistry, SessionStatus};
