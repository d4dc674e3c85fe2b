//! Voice client for a remote conversational agent.
//!
//! Records an utterance from the microphone, ships it to the agent over a
//! WebSocket, and plays the synthesized reply back gaplessly as PCM chunks
//! stream in.

pub mod audio;
pub mod capture;
pub mod config;
pub mod console;
pub mod error;
pub mod gui_bridge;
pub mod net_link;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod visualizer;

pub use error::{Error, Result};
