use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::events::{EventBus, ManagerEvent};
use crate::model::Track;

/// Cola de tracks de un player.
///
/// El track actual vive fuera de la secuencia pendiente: `size()` cuenta lo
/// que falta por sonar y `total_size()` suma el actual.
#[derive(Debug)]
pub struct Queue {
    guild_id: String,
    items: VecDeque<Track>,
    current: Option<Track>,
    /// El más reciente primero
    previous: VecDeque<Track>,
    max_history: usize,
    events: EventBus,
}

impl Queue {
    pub fn new(guild_id: impl Into<String>, max_history: usize, events: EventBus) -> Self {
        Self {
            guild_id: guild_id.into(),
            items: VecDeque::new(),
            current: None,
            previous: VecDeque::new(),
            max_history,
            events,
        }
    }

    /// Agrega tracks a la cola. Si no hay track actual, el primero pasa a ser el actual.
    ///
    /// Si algún track no es reproducible no se agrega ninguno.
    pub fn add(&mut self, tracks: impl IntoIterator<Item = Track>) -> Result<()> {
        let tracks: Vec<Track> = tracks.into_iter().collect();
        if let Some(bad) = tracks.iter().find(|t| !t.is_playable()) {
            return Err(Error::InvalidTrackType(format!(
                "'{}' has no encoded payload",
                bad.info.identifier
            )));
        }

        let mut tracks = tracks.into_iter();
        if self.current.is_none() {
            self.current = tracks.next();
        }
        let before = self.items.len();
        self.items.extend(tracks);

        info!(guild = %self.guild_id, added = self.items.len() - before, "➕ queue extended");
        self.notify();
        Ok(())
    }

    /// Elimina un track específico
    pub fn remove(&mut self, index: usize) -> Result<Track> {
        let track = self.items.remove(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.items.len(),
        })?;

        debug!(guild = %self.guild_id, index, "❌ track removed");
        self.notify();
        Ok(track)
    }

    /// Mezcla la cola (Fisher–Yates), el track actual no se toca
    pub fn shuffle(&mut self) {
        let mut items: Vec<_> = self.items.drain(..).collect();
        items.shuffle(&mut rand::thread_rng());
        self.items.extend(items);

        info!(guild = %self.guild_id, "🔀 queue shuffled");
        self.notify();
    }

    /// Limpia la cola, conserva el actual y el historial
    pub fn clear(&mut self) {
        self.items.clear();
        info!(guild = %self.guild_id, "🗑️ queue cleared");
        self.notify();
    }

    /// Pasa el actual al historial y promueve el siguiente
    pub fn advance(&mut self) -> Option<Track> {
        if let Some(current) = self.current.take() {
            self.previous.push_front(current);
            self.previous.truncate(self.max_history);
        }

        self.current = self.items.pop_front();
        match &self.current {
            Some(track) => debug!(guild = %self.guild_id, title = %track.title(), "➡️ next track"),
            None => debug!(guild = %self.guild_id, "📭 queue exhausted"),
        }

        self.notify();
        self.current.clone()
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> impl Iterator<Item = &Track> {
        self.previous.iter()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.items.iter()
    }

    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn total_size(&self) -> usize {
        self.items.len() + usize::from(self.current.is_some())
    }

    /// Verifica si no queda nada pendiente (el actual no cuenta)
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Duración de lo pendiente (sin el actual)
    pub fn duration(&self) -> Duration {
        self.items.iter().map(Track::duration).sum()
    }

    fn notify(&self) {
        self.events.emit(ManagerEvent::QueueUpdate {
            guild_id: self.guild_id.clone(),
            size: self.size(),
            total_size: self.total_size(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TrackInfo;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn track(id: &str) -> Track {
        Track {
            encoded: format!("enc-{id}"),
            info: TrackInfo {
                identifier: id.to_string(),
                title: id.to_string(),
                length: 60_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn ids<'a>(tracks: impl Iterator<Item = &'a Track>) -> Vec<String> {
        tracks.map(|t| t.info.identifier.clone()).collect()
    }

    fn queue() -> Queue {
        Queue::new("42", 3, EventBus::new())
    }

    #[test]
    fn first_added_track_becomes_current() {
        let mut queue = queue();
        queue.add([track("t1"), track("t2")]).unwrap();

        assert_eq!(queue.current().unwrap().info.identifier, "t1");
        assert_eq!(ids(queue.tracks()), vec!["t2"]);
        assert_eq!(queue.total_size(), 2);

        queue.remove(0).unwrap();
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.current().unwrap().info.identifier, "t1");
    }

    #[test]
    fn unplayable_track_rejects_whole_batch() {
        let mut queue = queue();
        let mut broken = track("bad");
        broken.encoded.clear();

        let err = queue.add([track("ok"), broken]).unwrap_err();

        assert!(matches!(err, Error::InvalidTrackType(_)));
        assert_eq!(queue.total_size(), 0);
        assert!(queue.current().is_none());
    }

    #[test]
    fn remove_is_bounds_checked() {
        let mut queue = queue();
        queue.add([track("t1"), track("t2")]).unwrap();

        let err = queue.remove(1).unwrap_err();
        assert!(matches!(err, Error::IndexOutOfRange { index: 1, len: 1 }));
    }

    #[test]
    fn total_size_invariant_holds_for_random_operations() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut queue = queue();

        for step in 0..500 {
            match rng.gen_range(0..5) {
                0 | 1 => {
                    let n = rng.gen_range(1..4);
                    let batch: Vec<_> = (0..n).map(|i| track(&format!("{step}-{i}"))).collect();
                    queue.add(batch).unwrap();
                }
                2 => {
                    let index = rng.gen_range(0..=queue.size());
                    let _ = queue.remove(index);
                }
                3 => queue.clear(),
                _ => {
                    queue.advance();
                }
            }

            assert_eq!(
                queue.total_size(),
                queue.size() + usize::from(queue.current().is_some())
            );
        }
    }

    #[test]
    fn shuffle_is_a_permutation_of_pending_tracks() {
        let mut queue = queue();
        queue
            .add((0..20).map(|i| track(&i.to_string())))
            .unwrap();
        let current = queue.current().cloned();
        let mut before = ids(queue.tracks());

        queue.shuffle();

        let mut after = ids(queue.tracks());
        assert_eq!(queue.current().cloned(), current);
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn clear_keeps_current_and_history() {
        let mut queue = queue();
        queue.add([track("a"), track("b"), track("c")]).unwrap();
        queue.advance();

        queue.clear();

        assert_eq!(queue.current().unwrap().info.identifier, "b");
        assert_eq!(ids(queue.previous()), vec!["a"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn history_is_bounded_most_recent_first() {
        let mut queue = queue();
        queue.add((0..6).map(|i| track(&i.to_string()))).unwrap();
        for _ in 0..5 {
            queue.advance();
        }

        assert_eq!(ids(queue.previous()), vec!["4", "3", "2"]);
        assert_eq!(queue.current().unwrap().info.identifier, "5");
    }

    #[test]
    fn duration_counts_pending_tracks_only() {
        let mut queue = queue();
        queue.add([track("a"), track("b"), track("c")]).unwrap();

        assert_eq!(queue.duration(), Duration::from_secs(120));
    }

    #[test]
    fn every_mutation_emits_queue_update() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let mut queue = Queue::new("42", 3, events);

        queue.add([track("a")]).unwrap();
        queue.add([track("b")]).unwrap();
        queue.shuffle();
        queue.remove(0).unwrap();
        queue.clear();

        let sizes: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|event| match event {
                ManagerEvent::QueueUpdate { size, total_size, .. } => (size, total_size),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(sizes, vec![(0, 1), (1, 2), (1, 2), (0, 1), (0, 1)]);
    }
}
