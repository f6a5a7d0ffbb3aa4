//! Journal client plumbing: the websocket chat sync with its integrity
//! check, the per-entry chat managers, and voice notes from recording
//! through upload and transcription.

pub mod api;
pub mod chat;
pub mod clock;
pub mod crypto;
pub mod mailbox;
pub mod settings;
pub mod task;
pub mod upload;
pub mod voice_note;
