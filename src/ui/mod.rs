//! Discord-facing presentation: embeds, the now-playing panel renderer and its reaction
//! controls.

pub mod controls;
pub mod embeds;

pub use controls::PanelControl;
pub use embeds::EmbedRenderer;
