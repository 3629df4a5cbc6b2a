//! murmur-core: shared protocol library for the murmur chat server.
//!
//! Provides the JSON envelope types, frame codec, error taxonomy with
//! stable wire codes, and HMAC access keys.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{frame_decode, frame_decode_bounded, frame_decode_bytes, frame_encode};
pub use envelope::{
    Authorized, ChatMessage, ClientEnvelope, MessagePage, ServerEnvelope, SysEvent, UserInfo,
    UserList, PUBLIC_CHANNEL,
};
pub use error::{ErrorKind, MurmurError, MurmurResult};
pub use token::{create_access_key, generate_secret, verify_access_key};
