//! Realtime voice session orchestration.
//!
//! [`lifecycle::SessionController`] is the entry point: it opens a realtime
//! session through a [`client::RealtimeClientFactory`], runs the event
//! dispatch loop, executes tool calls, drives audio capture and playback,
//! negotiates the avatar video transport and keeps the conversation going
//! with the proactive timer.

pub mod activity;
pub mod audio;
pub mod avatar;
pub mod client;
pub mod derive;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod proactive;
pub mod protocol;
pub mod settings;
pub mod tools;
pub mod transcript;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{AudioError, AvatarError, SessionError, ToolError};
pub use lifecycle::{ControllerOptions, LifecycleState, SessionController};
