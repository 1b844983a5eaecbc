//! ComfyUI protocol client.
//!
//! Submits workflows over HTTP, tracks their completion through the
//! WebSocket event stream (falling back to history polling), and
//! downloads the resulting artifacts. [`manager::ComfyUIManager`] is the
//! entry point; the other modules are its building blocks.

pub mod api;
pub mod client;
pub mod completion;
pub mod events;
pub mod history;
pub mod manager;
pub mod messages;
pub mod metadata;

#[cfg(feature = "test-util")]
pub mod testing;
