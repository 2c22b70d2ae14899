//! Terminal callback delivery.
//!
//! A run reports its terminal result exactly once to whatever started it,
//! addressed by an opaque callback token. [`CallbackChannel`] is the
//! capability; [`IdempotentCallbacks`] makes any channel safe under
//! duplicate delivery. [`RecordingCallbackChannel`] keeps results in memory
//! and [`LoggingCallbackChannel`] only logs them.

pub mod box_channel;
pub mod channel;
pub mod idempotent;
pub mod logging;
pub mod recording;

pub use box_channel::BoxCallbackChannel;
pub use channel::{CallbackChannel, CallbackError, Delivery};
pub use idempotent::IdempotentCallbacks;
pub use logging::LoggingCallbackChannel;
pub use recording::{CallbackRecord, RecordingCallbackChannel};
