//! # Utila Music
//!
//! Discord music bot core. Each guild gets its own player that owns a queue and at most
//! one running ffmpeg pipeline; all of a guild's operations are handled one at a time by
//! that player, while different guilds run fully in parallel.
//!
//! - [`audio`]: queue, pipeline supervision, per-guild player, registry and status panel
//! - [`sources`]: track descriptors and the yt-dlp resolver
//! - [`bot`]: slash commands and serenity event handling
//! - [`ui`]: embeds
//! - [`config`]: environment configuration

pub mod audio;
pub mod bot;
pub mod config;
pub mod error;
pub mod sources;
pub mod ui;
