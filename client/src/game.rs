use log::{debug, info};
use shared::{Event, EventKind};
use std::collections::HashMap;

/// Game object layer driven by the scheduler.
///
/// Objects are addressed by id; the scheduler never caches references into
/// the implementation, so an object destroyed between two events is simply
/// reported as missing.
pub trait GameObjects: Send {
    fn contains(&self, id: &str) -> bool;

    fn create_object(&mut self, id: &str, x: f64, y: f64);

    /// Returns false when no object with `id` exists
    fn apply_movement(&mut self, id: &str, x: f64, y: f64, flag: bool) -> bool;

    /// Returns false when no object with `id` exists
    fn destroy_object(&mut self, id: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Character {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub positive: bool,
    pub moves: u32,
}

impl Character {
    pub fn new(id: &str, x: f64, y: f64) -> Self {
        Self {
            id: id.to_string(),
            x,
            y,
            positive: true,
            moves: 0,
        }
    }
}

/// Minimal character table used by the headless client and the tests
#[derive(Debug, Clone, Default)]
pub struct Characters {
    pub characters: HashMap<String, Character>,
}

impl Characters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Character> {
        self.characters.get(id)
    }

    pub fn len(&self) -> usize {
        self.characters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.characters.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl GameObjects for Characters {
    fn contains(&self, id: &str) -> bool {
        self.characters.contains_key(id)
    }

    fn create_object(&mut self, id: &str, x: f64, y: f64) {
        info!("Added character {} at ({:.1}, {:.1})", id, x, y);
        self.characters
            .insert(id.to_string(), Character::new(id, x, y));
    }

    fn apply_movement(&mut self, id: &str, x: f64, y: f64, flag: bool) -> bool {
        match self.characters.get_mut(id) {
            Some(character) => {
                character.x = x;
                character.y = y;
                character.positive = flag;
                character.moves += 1;
                true
            }
            None => false,
        }
    }

    fn destroy_object(&mut self, id: &str) -> bool {
        let removed = self.characters.remove(id).is_some();
        if removed {
            info!("Removed character {}", id);
        }
        removed
    }
}

/// Captures executed movements while a recording session is active
#[derive(Debug, Default)]
pub struct Recorder {
    capturing: bool,
    log: Vec<Event>,
}

impl Recorder {
    pub fn start(&mut self) {
        self.log.clear();
        self.capturing = true;
    }

    /// Stops capturing and seals the log with `end`
    pub fn finish(&mut self, end: Event) {
        self.capturing = false;
        self.log.push(end);
    }

    pub fn capture(&mut self, event: &Event) {
        if self.capturing && event.is_movement() {
            self.log.push(event.clone());
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// A finished log ending in its end-of-playback marker
    pub fn is_sealed(&self) -> bool {
        !self.capturing
            && self
                .log
                .last()
                .is_some_and(|event| event.kind == EventKind::EndPlayback)
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn take_log(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.log)
    }

    pub fn clear(&mut self) {
        self.capturing = false;
        self.log.clear();
    }
}

/// State behind the scheduler's narrow lock: the game objects, this peer's
/// not-yet-sent movements and the replay recorder
pub struct Stage<O> {
    pub objects: O,
    pub recorder: Recorder,
    outbound: Vec<Event>,
}

impl<O: GameObjects> Stage<O> {
    pub fn new(objects: O) -> Self {
        Self {
            objects,
            recorder: Recorder::default(),
            outbound: Vec::new(),
        }
    }

    /// Appends a locally generated movement to the outbound list
    pub fn queue_local(&mut self, event: Event) {
        self.recorder.capture(&event);
        self.outbound.push(event);
    }

    pub fn take_outbound(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.outbound)
    }

    pub fn clear_outbound(&mut self) {
        if !self.outbound.is_empty() {
            debug!("Dropping {} unsent movements", self.outbound.len());
        }
        self.outbound.clear();
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_character_table() {
        let mut characters = Characters::new();
        assert!(characters.is_empty());

        characters.create_object("B", 3.0, 4.0);
        assert!(characters.contains("B"));
        assert_eq!(characters.len(), 1);

        let character = characters.get("B").unwrap();
        assert_eq!(character.x, 3.0);
        assert_eq!(character.y, 4.0);
        assert_eq!(character.moves, 0);
    }

    #[test]
    fn test_apply_movement() {
        let mut characters = Characters::new();
        characters.create_object("B", 0.0, 0.0);

        assert!(characters.apply_movement("B", 5.0, 6.0, false));
        let character = characters.get("B").unwrap();
        assert_eq!((character.x, character.y), (5.0, 6.0));
        assert!(!character.positive);
        assert_eq!(character.moves, 1);

        assert!(!characters.apply_movement("missing", 1.0, 1.0, true));
    }

    #[test]
    fn test_destroy_object() {
        let mut characters = Characters::new();
        characters.create_object("A", 0.0, 0.0);
        characters.create_object("B", 0.0, 0.0);

        assert!(characters.destroy_object("B"));
        assert!(!characters.destroy_object("B"));
        assert_eq!(characters.ids(), vec!["A".to_string()]);
    }

    #[test]
    fn test_recorder_only_captures_while_active() {
        let mut recorder = Recorder::default();
        let movement = Event::movement(1.0, "B", "B", 0.0, 0.0, true);

        recorder.capture(&movement);
        assert!(recorder.is_empty());

        recorder.start();
        recorder.capture(&movement);
        recorder.capture(&Event::disconnect(2.0, "C", "B"));
        assert_eq!(recorder.len(), 1);

        assert!(!recorder.is_sealed());
        recorder.finish(Event::end_playback(3.0));
        assert!(!recorder.is_capturing());
        assert!(recorder.is_sealed());
        recorder.capture(&movement);

        let log = recorder.take_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1], Event::end_playback(3.0));
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_stage_outbound() {
        let mut stage = Stage::new(Characters::new());
        stage.recorder.start();
        stage.queue_local(Event::movement(1.0, "A", "A", 1.0, 1.0, true));
        stage.queue_local(Event::movement(2.0, "A", "A", 2.0, 1.0, true));

        assert_eq!(stage.outbound_len(), 2);
        assert_eq!(stage.recorder.len(), 2);

        let sent = stage.take_outbound();
        assert_eq!(sent.len(), 2);
        assert_eq!(stage.outbound_len(), 0);

        stage.queue_local(Event::movement(3.0, "A", "A", 3.0, 1.0, true));
        stage.clear_outbound();
        assert_eq!(stage.outbound_len(), 0);
    }
}
