use rand::seq::SliceRandom;
use std::{collections::VecDeque, fmt, str::FromStr, time::Duration};
use tracing::{debug, info};

use crate::{error::InvalidOperation, sources::TrackDescriptor};

pub const VOLUME_MIN: u16 = 0;
pub const VOLUME_MAX: u16 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl LoopMode {
    /// Ciclo off -> track -> queue -> off
    pub fn cycle(self) -> Self {
        match self {
            LoopMode::Off => LoopMode::Track,
            LoopMode::Track => LoopMode::Queue,
            LoopMode::Queue => LoopMode::Off,
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopMode::Off => "off",
            LoopMode::Track => "track",
            LoopMode::Queue => "queue",
        };
        f.write_str(name)
    }
}

impl FromStr for LoopMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(LoopMode::Off),
            "track" => Ok(LoopMode::Track),
            "queue" => Ok(LoopMode::Queue),
            other => Err(format!("modo de repetición inválido: {}", other)),
        }
    }
}

/// How the current track ended when asking for the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Fin natural del stream: se aplica el modo de repetición.
    Completed,
    /// Cancelación explícita (skip, fallo): el track actual se descarta.
    Skipped,
}

/// Cola de una guild. Solo su `GuildPlayer` la toca.
#[derive(Debug)]
pub struct GuildQueue {
    pending: VecDeque<TrackDescriptor>,
    current: Option<TrackDescriptor>,
    loop_mode: LoopMode,
    volume: u16,
    max_size: usize,
}

impl GuildQueue {
    pub fn new(default_volume: u16, max_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            loop_mode: LoopMode::Off,
            volume: default_volume.min(VOLUME_MAX),
            max_size,
        }
    }

    /// Agrega un track al final; devuelve el nuevo largo de la cola
    pub fn enqueue(&mut self, track: TrackDescriptor) -> Result<usize, InvalidOperation> {
        if self.pending.len() >= self.max_size {
            return Err(InvalidOperation::QueueFull(self.max_size));
        }

        info!("➕ Agregado a la cola: {}", track.title());
        self.pending.push_back(track);
        Ok(self.pending.len())
    }

    /// Pone un track como actual sin pasar por la cola
    pub fn set_current(&mut self, track: TrackDescriptor) {
        self.current = Some(track);
    }

    /// Retira el track actual sin avanzar
    pub fn take_current(&mut self) -> Option<TrackDescriptor> {
        self.current.take()
    }

    /// Obtiene el siguiente track respetando el modo de repetición.
    ///
    /// On failure `current` is left empty.
    pub fn dequeue_next(&mut self, advance: Advance) -> Result<TrackDescriptor, InvalidOperation> {
        let finished = self.current.take();

        if let (Advance::Completed, Some(finished)) = (advance, finished) {
            match self.loop_mode {
                LoopMode::Track => {
                    info!("🔂 Repitiendo track: {}", finished.title());
                    self.current = Some(finished.clone());
                    return Ok(finished);
                }
                LoopMode::Queue => {
                    info!("🔁 Track agregado al final por loop de cola: {}", finished.title());
                    self.pending.push_back(finished);
                }
                LoopMode::Off => {}
            }
        }

        match self.pending.pop_front() {
            Some(next) => {
                info!("➡️ Siguiente en cola: {}", next.title());
                self.current = Some(next.clone());
                Ok(next)
            }
            None => {
                info!("📭 Cola vacía, no hay siguiente track");
                Err(InvalidOperation::QueueEmpty)
            }
        }
    }

    /// Elimina y devuelve el track en la posición (0-based) de la cola pendiente
    pub fn remove_at(&mut self, index: usize) -> Result<TrackDescriptor, InvalidOperation> {
        let len = self.pending.len();
        let removed = self
            .pending
            .remove(index)
            .ok_or(InvalidOperation::IndexOutOfRange { index, len })?;
        debug!("❌ Track eliminado en posición {}", index);
        Ok(removed)
    }

    /// Mueve un track a una nueva posición conservando el orden relativo del resto
    pub fn move_to(&mut self, from: usize, to: usize) -> Result<(), InvalidOperation> {
        let len = self.pending.len();
        for index in [from, to] {
            if index >= len {
                return Err(InvalidOperation::IndexOutOfRange { index, len });
            }
        }

        if from != to {
            if let Some(item) = self.pending.remove(from) {
                self.pending.insert(to, item);
            }
            debug!("📍 Track movido de posición {} a {}", from, to);
        }

        Ok(())
    }

    /// Lleva el track indicado al frente de la cola
    pub fn jump_to(&mut self, index: usize) -> Result<&TrackDescriptor, InvalidOperation> {
        self.move_to(index, 0)?;
        self.pending.front().ok_or(InvalidOperation::QueueEmpty)
    }

    /// Mezcla la cola pendiente (el actual no se toca)
    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        self.pending.make_contiguous().shuffle(&mut rng);
        info!("🔀 Cola mezclada ({} canciones)", self.pending.len());
    }

    /// Limpia la cola pendiente; devuelve cuántos tracks se quitaron
    pub fn clear(&mut self) -> usize {
        let removed = self.pending.len();
        self.pending.clear();
        info!("🗑️ Cola limpiada");
        removed
    }

    /// Limpia duplicados (por fuente), conservando la primera aparición
    pub fn remove_duplicates(&mut self) -> usize {
        let mut seen = std::collections::HashSet::new();
        let original_len = self.pending.len();

        self.pending
            .retain(|item| seen.insert(item.source_ref().to_string()));

        let removed = original_len - self.pending.len();
        if removed > 0 {
            info!("🗑️ Eliminados {} duplicados", removed);
        }
        removed
    }

    pub fn list(&self) -> Vec<TrackDescriptor> {
        self.pending.iter().cloned().collect()
    }

    pub fn current(&self) -> Option<&TrackDescriptor> {
        self.current.as_ref()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
        match mode {
            LoopMode::Off => info!("➡️ Repetición desactivada"),
            LoopMode::Track => info!("🔂 Repetir canción activado"),
            LoopMode::Queue => info!("🔁 Repetir cola activado"),
        }
    }

    pub fn volume(&self) -> u16 {
        self.volume
    }

    pub fn set_volume(&mut self, percent: u16) -> Result<(), InvalidOperation> {
        if percent > VOLUME_MAX {
            return Err(InvalidOperation::VolumeOutOfRange(percent));
        }
        self.volume = percent;
        Ok(())
    }

    /// Duración total de lo que queda en la cola (sin el actual)
    pub fn remaining_duration(&self) -> Duration {
        self.pending.iter().filter_map(|item| item.duration()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    fn track(name: &str) -> TrackDescriptor {
        TrackDescriptor::new(format!("https://example.com/{}", name), name, UserId::new(1))
    }

    fn titles(queue: &GuildQueue) -> Vec<String> {
        queue.list().iter().map(|t| t.title().to_string()).collect()
    }

    fn queue_of(names: &[&str]) -> GuildQueue {
        let mut queue = GuildQueue::new(100, 100);
        for name in names {
            queue.enqueue(track(name)).unwrap();
        }
        queue
    }

    #[test]
    fn enqueue_preserves_submission_order() {
        let mut queue = GuildQueue::new(100, 100);
        assert_eq!(queue.enqueue(track("a")).unwrap(), 1);
        assert_eq!(queue.enqueue(track("b")).unwrap(), 2);
        assert_eq!(queue.enqueue(track("c")).unwrap(), 3);
        assert_eq!(titles(&queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn enqueue_rejects_when_full() {
        let mut queue = GuildQueue::new(100, 2);
        queue.enqueue(track("a")).unwrap();
        queue.enqueue(track("b")).unwrap();
        assert_eq!(queue.enqueue(track("c")), Err(InvalidOperation::QueueFull(2)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn dequeue_off_pops_head() {
        let mut queue = queue_of(&["a", "b"]);
        assert_eq!(queue.dequeue_next(Advance::Completed).unwrap().title(), "a");
        assert_eq!(queue.dequeue_next(Advance::Completed).unwrap().title(), "b");
        assert_eq!(queue.dequeue_next(Advance::Completed), Err(InvalidOperation::QueueEmpty));
        assert!(queue.current().is_none());
    }

    #[test]
    fn loop_track_repeats_current_without_consuming() {
        let mut queue = queue_of(&["a", "b"]);
        queue.set_loop_mode(LoopMode::Track);
        queue.dequeue_next(Advance::Completed).unwrap();

        for _ in 0..5 {
            assert_eq!(queue.dequeue_next(Advance::Completed).unwrap().title(), "a");
        }
        assert_eq!(titles(&queue), vec!["b"]);
    }

    #[test]
    fn loop_queue_requeues_finished_track_at_tail() {
        let mut queue = queue_of(&["a", "b", "c"]);
        queue.set_loop_mode(LoopMode::Queue);
        queue.dequeue_next(Advance::Completed).unwrap();

        assert_eq!(queue.dequeue_next(Advance::Completed).unwrap().title(), "b");
        assert_eq!(titles(&queue), vec!["c", "a"]);
    }

    #[test]
    fn loop_queue_with_single_track_replays_it() {
        let mut queue = queue_of(&["a"]);
        queue.set_loop_mode(LoopMode::Queue);
        queue.dequeue_next(Advance::Completed).unwrap();
        assert_eq!(queue.dequeue_next(Advance::Completed).unwrap().title(), "a");
        assert!(queue.is_empty());
    }

    #[test]
    fn skip_never_requeues() {
        let mut queue = queue_of(&["a", "b"]);
        queue.set_loop_mode(LoopMode::Queue);
        queue.dequeue_next(Advance::Completed).unwrap();

        assert_eq!(queue.dequeue_next(Advance::Skipped).unwrap().title(), "b");
        assert!(queue.is_empty());

        queue.set_loop_mode(LoopMode::Track);
        assert_eq!(queue.dequeue_next(Advance::Skipped), Err(InvalidOperation::QueueEmpty));
    }

    #[test]
    fn remove_at_checks_bounds() {
        let mut queue = queue_of(&["a", "b", "c"]);
        assert_eq!(queue.remove_at(1).unwrap().title(), "b");
        assert_eq!(
            queue.remove_at(2),
            Err(InvalidOperation::IndexOutOfRange { index: 2, len: 2 })
        );
        assert_eq!(titles(&queue), vec!["a", "c"]);
    }

    #[test]
    fn remove_at_never_touches_current() {
        let mut queue = queue_of(&["a"]);
        queue.dequeue_next(Advance::Completed).unwrap();
        assert!(queue.remove_at(0).is_err());
        assert_eq!(queue.current().map(|t| t.title()), Some("a"));
    }

    #[test]
    fn move_to_preserves_relative_order() {
        let mut queue = queue_of(&["a", "b", "c", "d"]);
        queue.move_to(0, 2).unwrap();
        assert_eq!(titles(&queue), vec!["b", "c", "a", "d"]);
        queue.move_to(3, 0).unwrap();
        assert_eq!(titles(&queue), vec!["d", "b", "c", "a"]);
        assert_eq!(
            queue.move_to(1, 4),
            Err(InvalidOperation::IndexOutOfRange { index: 4, len: 4 })
        );
        assert_eq!(titles(&queue), vec!["d", "b", "c", "a"]);
    }

    #[test]
    fn jump_to_brings_entry_to_front() {
        let mut queue = queue_of(&["a", "b", "c"]);
        assert_eq!(queue.jump_to(2).unwrap().title(), "c");
        assert_eq!(titles(&queue), vec!["c", "a", "b"]);
    }

    #[test]
    fn shuffle_is_a_permutation_and_keeps_current() {
        let names: Vec<String> = (0..50).map(|i| format!("t{}", i)).collect();
        let mut queue = GuildQueue::new(100, 100);
        for name in &names {
            queue.enqueue(track(name)).unwrap();
        }
        let current = queue.dequeue_next(Advance::Completed).unwrap();

        let mut before = titles(&queue);
        queue.shuffle();
        let mut after = titles(&queue);

        assert_eq!(queue.current(), Some(&current));
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn clear_leaves_current() {
        let mut queue = queue_of(&["a", "b", "c"]);
        queue.dequeue_next(Advance::Completed).unwrap();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.current().map(|t| t.title()), Some("a"));
    }

    #[test]
    fn remove_duplicates_keeps_first() {
        let mut queue = queue_of(&["a", "b", "a", "c", "b"]);
        assert_eq!(queue.remove_duplicates(), 2);
        assert_eq!(titles(&queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn volume_and_loop_changes_keep_order() {
        let mut queue = queue_of(&["a", "b", "c"]);
        queue.set_volume(150).unwrap();
        queue.set_loop_mode(LoopMode::Queue);
        assert_eq!(queue.set_volume(201), Err(InvalidOperation::VolumeOutOfRange(201)));
        assert_eq!(queue.volume(), 150);
        assert_eq!(titles(&queue), vec!["a", "b", "c"]);
    }

    #[test]
    fn loop_mode_parsing_and_cycle() {
        assert_eq!("Track".parse::<LoopMode>(), Ok(LoopMode::Track));
        assert!("forever".parse::<LoopMode>().is_err());
        assert_eq!(LoopMode::Off.cycle().cycle().cycle(), LoopMode::Off);
        assert_eq!(LoopMode::Queue.to_string(), "queue");
    }
}
