//! Error taxonomy for the player core.
//!
//! Resolution and launch failures are absorbed by the guild player (it advances the
//! queue and surfaces the message in the status panel). Invalid operations come back
//! to the caller synchronously and never change state.

use std::time::Duration;

use thiserror::Error;

/// Result type used across the player core.
pub type PlayerResult<T> = Result<T, PlayerError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlayerError {
    /// The source could not be resolved or is not playable.
    #[error("no se pudo resolver la fuente: {0}")]
    Resolution(String),

    /// The encoder process failed to start.
    #[error("no se pudo iniciar el encoder: {0}")]
    PipelineLaunch(String),

    /// Rejected synchronously; no state was changed.
    #[error(transparent)]
    InvalidOperation(#[from] InvalidOperation),

    /// Internal invariant broken. Aborts the offending guild player only.
    #[error("violación de concurrencia: {0}")]
    ConcurrencyViolation(String),

    /// The player was torn down before the request could be handled.
    #[error("el reproductor de esta guild ya no existe")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvalidOperation {
    #[error("no hay nada reproduciéndose")]
    NothingPlaying,

    #[error("la reproducción no está pausada")]
    NotPaused,

    #[error("la reproducción no está activa")]
    NotPlaying,

    #[error("la cola está vacía")]
    QueueEmpty,

    #[error("índice {index} fuera de rango (la cola tiene {len} canciones)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("volumen {0}% fuera de rango (0-200)")]
    VolumeOutOfRange(u16),

    #[error("posición {offset:?} fuera de la duración de la canción ({duration:?})")]
    SeekOutOfRange { offset: Duration, duration: Duration },

    #[error("la cola está llena (máximo {0} canciones)")]
    QueueFull(usize),
}

impl PlayerError {
    /// Whether the error leaves the guild session usable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PlayerError::ConcurrencyViolation(_) | PlayerError::Closed)
    }
}
