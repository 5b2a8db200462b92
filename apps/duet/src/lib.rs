//! Call negotiation core for paired voice/video calling.
//!
//! Two participants establish a direct WebRTC connection by polling a
//! shared session record in an external store; there is no push channel.
//! [`call::CallManager`] is the entry point: it discovers incoming calls,
//! places outgoing ones, and drives offer/answer/candidate exchange until
//! the transport connects or the session dies.

pub mod call;
pub mod config;
pub mod media;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod transport;

pub use call::{CallError, CallManager, EndReason, Notice, notice_channel};
pub use config::Config;
pub use store::{CallStatus, CallType};
