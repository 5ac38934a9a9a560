//! # Audio Module
//!
//! Per-guild playback core for Utila Music.
//!
//! ## Architecture
//!
//! ### [`registry`] - Player Registry
//! - One [`player::GuildPlayer`] per guild, created atomically on first use
//! - Players remove themselves after the idle timeout
//!
//! ### [`player`] - Guild Player
//! - Actor task owning the queue, the pipeline and the idle timer
//! - Every command and every pipeline completion is handled in order
//!
//! ### [`queue`] - Guild Queue
//! - Pending tracks, current track, loop mode and volume
//!
//! ### [`pipeline`] - Encoder Pipeline Supervisor
//! - At most one encoder per guild; stop waits for the process to exit
//! - [`ffmpeg`] launches the real encoder, [`voice`] forwards frames to songbird
//!
//! ### [`debounce`] - Status Debouncer
//! - Coalesces panel refreshes to at most one per interval per guild
//!
//! ## Audio Format
//!
//! - **Sample Rate**: 48kHz (Discord standard)
//! - **Samples**: 32-bit float, little endian
//! - **Channels**: Stereo (2 channels)
//! - **Frame**: 20ms

pub mod debounce;
pub mod ffmpeg;
pub mod pipeline;
pub mod player;
pub mod queue;
pub mod registry;
pub mod status;
pub mod voice;

pub use debounce::{StatusDebouncer, StatusRenderer};
pub use player::{GuildPlayerHandle, PlayOutcome, PlayerSettings};
pub use queue::LoopMode;
pub use registry::PlayerRegistry;
pub use status::{PlayerState, StatusSnapshot};
