use std::collections::HashMap;

use canvas_core::{BlockId, Position};
use serde::{Deserialize, Serialize};

/// Ephemeral state of one connected collaborator.
///
/// `id` identifies the connection, not the user: the same user in two tabs shows up twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub color: String,
    /// Pointer position in canvas space
    #[serde(default)]
    pub cursor: Option<Position>,
    #[serde(default)]
    pub is_typing: bool,
    #[serde(default)]
    pub selection: Option<Vec<BlockId>>,
}

impl Presence {
    pub fn new(id: impl Into<String>, username: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: None,
            username: username.into(),
            display_name: None,
            avatar_url: None,
            color: color.into(),
            cursor: None,
            is_typing: false,
            selection: None,
        }
    }

    /// Name shown next to the cursor
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

/// Pan and zoom of a client's view onto the canvas
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            zoom: 1.0,
        }
    }
}

impl Viewport {
    pub fn new(x: f64, y: f64, zoom: f64) -> Self {
        Self { x, y, zoom }
    }

    pub fn to_screen(&self, point: Position) -> Position {
        Position::new(point.x * self.zoom + self.x, point.y * self.zoom + self.y)
    }

    pub fn to_canvas(&self, point: Position) -> Position {
        let zoom = if self.zoom == 0.0 { 1.0 } else { self.zoom };
        Position::new((point.x - self.x) / zoom, (point.y - self.y) / zoom)
    }
}

/// Presence of everyone on a project, keyed by connection
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: HashMap<String, Presence>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins; returns true when the entry changed
    pub fn upsert(&mut self, presence: Presence) -> bool {
        match self.entries.get(&presence.id) {
            Some(existing) if *existing == presence => false,
            _ => {
                self.entries.insert(presence.id.clone(), presence);
                true
            }
        }
    }

    /// Drop a connection's presence when it disconnects
    pub fn remove(&mut self, id: &str) -> Option<Presence> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Presence> {
        self.entries.get(id)
    }

    /// Everyone except `id`, sorted for stable rendering
    pub fn others(&self, id: &str) -> Vec<&Presence> {
        let mut others: Vec<&Presence> = self.entries.values().filter(|p| p.id != id).collect();
        others.sort_by(|a, b| a.id.cmp(&b.id));
        others
    }

    /// Collaborators currently typing inside `block_id`
    pub fn typing_in(&self, block_id: &str) -> Vec<&Presence> {
        self.entries
            .values()
            .filter(|p| {
                p.is_typing
                    && p.selection
                        .as_ref()
                        .is_some_and(|s| s.iter().any(|id| id == block_id))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins_and_removal() {
        let mut registry = PresenceRegistry::new();
        let mut alice = Presence::new("c1", "alice", "#f00");
        assert!(registry.upsert(alice.clone()));
        assert!(!registry.upsert(alice.clone()));

        alice.cursor = Some(Position::new(10.0, 20.0));
        assert!(registry.upsert(alice));
        assert_eq!(
            registry.get("c1").unwrap().cursor,
            Some(Position::new(10.0, 20.0))
        );

        registry.upsert(Presence::new("c2", "bob", "#0f0"));
        assert_eq!(registry.others("c1").len(), 1);
        assert_eq!(registry.remove("c1").unwrap().username, "alice");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_typing_in_block() {
        let mut registry = PresenceRegistry::new();
        let mut bob = Presence::new("c2", "bob", "#0f0");
        bob.is_typing = true;
        bob.selection = Some(vec!["b1".into()]);
        registry.upsert(bob);
        registry.upsert(Presence::new("c3", "eve", "#00f"));

        assert_eq!(registry.typing_in("b1").len(), 1);
        assert!(registry.typing_in("b2").is_empty());
    }

    #[test]
    fn test_viewport_transform() {
        let viewport = Viewport::new(100.0, -50.0, 2.0);
        let screen = viewport.to_screen(Position::new(10.0, 10.0));
        assert_eq!(screen, Position::new(120.0, -30.0));
        assert_eq!(viewport.to_canvas(screen), Position::new(10.0, 10.0));
        assert_eq!(
            Viewport::default().to_screen(Position::new(3.0, 4.0)),
            Position::new(3.0, 4.0)
        );
    }

    #[test]
    fn test_presence_wire_shape() {
        let presence: Presence = serde_json::from_value(serde_json::json!({
            "id": "c1",
            "username": "alice",
            "displayName": "Alice",
            "color": "#f00",
            "isTyping": true
        }))
        .unwrap();
        assert_eq!(presence.label(), "Alice");
        assert!(presence.is_typing);
        assert_eq!(presence.cursor, None);
    }
}
