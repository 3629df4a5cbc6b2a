//! murmur-client: Rust client library for the murmur chat server.
//!
//! # Quick Start
//!
//! ```no_run
//! use murmur_client::ChatClient;
//!
//! # async fn example() -> murmur_core::MurmurResult<()> {
//! let mut client = ChatClient::connect("ws://127.0.0.1:8080").await?;
//! client.sign_up("alice", "correct horse").await?;
//! client.join(None).await?;
//! client.send_message(None, "hello, everyone").await?;
//!
//! let page = client.history(None, 0, 20).await?;
//! for message in page.messages {
//!     println!("{}: {}", message.sender, message.text);
//! }
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;

pub use client::ChatClient;
pub use connection::Connection;

// Re-export murmur-core error types for convenience.
pub use murmur_core::{MurmurError, MurmurResult};
