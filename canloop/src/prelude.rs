//! Traits in scope for method-call syntax
pub use crate::transfer::TransferCallbacks as _;
pub use canloop_core::Controller as _;
pub use canloop_core::InterruptBridge as _;
pub use canloop_core::InterruptHandler as _;
pub use embedded_can::Frame as _;
