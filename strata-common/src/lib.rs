// strata-common - Shared contracts for the Strata tiered cache store
//
// This crate defines the collaborator seams the off-heap tier consumes:
// the error taxonomy, the time source, the expiry and eviction-veto
// policies, and the value codec.

pub mod codec;
pub mod error;
pub mod expiry;
pub mod time;
pub mod veto;

// Re-export for convenience
pub use codec::{BytesCodec, JsonCodec, ValueCodec};
pub use error::{StoreError, StoreResult};
pub use expiry::{ExpiryDuration, ExpiryPolicy, NoExpiry, TimeToIdle, TimeToLive};
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
pub use veto::{EvictionVeto, FnVeto, NoVeto};
