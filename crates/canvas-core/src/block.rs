use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Fixed horizontal coordinate of the core anchor block
pub const CORE_BLOCK_X: f64 = 0.0;
/// Fixed vertical coordinate of the core anchor block
pub const CORE_BLOCK_Y: f64 = 0.0;

/// Block identifiers are client-generated strings (usually UUIDs)
pub type BlockId = String;

/// A point in canvas (content) space
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Position { x, y }
    }

    /// The pinned position of the core block
    pub const fn anchor() -> Self {
        Position::new(CORE_BLOCK_X, CORE_BLOCK_Y)
    }
}

/// Width and height of a block
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: f64,
    pub height: f64,
}

impl Dimensions {
    pub const fn new(width: f64, height: f64) -> Self {
        Dimensions { width, height }
    }
}

/// The closed set of block kinds a canvas can hold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    #[default]
    Text,
    Link,
    File,
    Core,
    Github,
    Palette,
    Contact,
    Video,
    Snippet,
    Checklist,
    Sketch,
}

/// Per-type behaviour, looked up through [`BlockType::spec`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockSpec {
    /// Size used by renderers when a block carries no explicit dimensions
    pub default_size: Dimensions,
    /// Whether the free-text body is edited through a character-level text CRDT
    pub text_like: bool,
}

impl BlockType {
    pub const ALL: [BlockType; 11] = [
        BlockType::Text,
        BlockType::Link,
        BlockType::File,
        BlockType::Core,
        BlockType::Github,
        BlockType::Palette,
        BlockType::Contact,
        BlockType::Video,
        BlockType::Snippet,
        BlockType::Checklist,
        BlockType::Sketch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Text => "text",
            BlockType::Link => "link",
            BlockType::File => "file",
            BlockType::Core => "core",
            BlockType::Github => "github",
            BlockType::Palette => "palette",
            BlockType::Contact => "contact",
            BlockType::Video => "video",
            BlockType::Snippet => "snippet",
            BlockType::Checklist => "checklist",
            BlockType::Sketch => "sketch",
        }
    }

    /// Parse a persisted type name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        BlockType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(name.trim()))
    }

    /// Dispatch table for type-specific behaviour
    pub fn spec(&self) -> BlockSpec {
        const CARD: Dimensions = Dimensions::new(320.0, 240.0);
        match self {
            BlockType::Core => BlockSpec {
                default_size: Dimensions::new(360.0, 480.0),
                text_like: true,
            },
            BlockType::Text | BlockType::Snippet => BlockSpec {
                default_size: CARD,
                text_like: true,
            },
            BlockType::Link
            | BlockType::File
            | BlockType::Github
            | BlockType::Palette
            | BlockType::Contact
            | BlockType::Video
            | BlockType::Checklist
            | BlockType::Sketch => BlockSpec {
                default_size: CARD,
                text_like: false,
            },
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys of [`BlockData`] that are typed fields rather than free-form type data
pub(crate) const RESERVED_DATA_KEYS: [&str; 8] = [
    "content",
    "blockType",
    "metadata",
    "ownerId",
    "isLocked",
    "authorName",
    "authorColor",
    "updatedAt",
];

/// The data bag of a block: shared fields plus free-form, type-specific fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockData {
    #[serde(default)]
    pub content: String,
    /// Explicit type override; wins over the node type when persisting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_type: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Type-specific fields folded in from the persisted `data` column
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

/// A positioned, typed node of the project graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: BlockId,
    #[serde(rename = "type", default)]
    pub block_type: BlockType,
    #[serde(default)]
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    /// Size reported by the renderer after measuring
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured: Option<Dimensions>,
    #[serde(default)]
    pub data: BlockData,
    #[serde(default)]
    pub selected: bool,
    #[serde(default = "default_true")]
    pub draggable: bool,
    #[serde(default = "default_true")]
    pub deletable: bool,
}

impl Block {
    pub fn new(id: impl Into<BlockId>, block_type: BlockType, position: Position) -> Self {
        let mut block = Self {
            id: id.into(),
            block_type,
            position,
            width: None,
            height: None,
            measured: None,
            data: BlockData::default(),
            selected: false,
            draggable: true,
            deletable: true,
        };
        block.pin_if_core();
        block
    }

    /// Create the project's core anchor block
    pub fn core(id: impl Into<BlockId>) -> Self {
        Self::new(id, BlockType::Core, Position::anchor())
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.data.content = content.into();
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.data.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn is_core(&self) -> bool {
        self.block_type == BlockType::Core
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.data.owner_id.as_deref()
    }

    pub fn content(&self) -> &str {
        &self.data.content
    }

    /// Enforce the core invariant: fixed position, never draggable or deletable.
    pub fn pin_if_core(&mut self) {
        if self.is_core() {
            self.position = Position::anchor();
            self.draggable = false;
            self.deletable = false;
        }
    }

    /// Explicit size, then the measured size, then the type default
    pub fn effective_size(&self) -> Dimensions {
        let default = self.block_type.spec().default_size;
        let measured = self.measured.unwrap_or(default);
        Dimensions::new(
            self.width.unwrap_or(measured.width),
            self.height.unwrap_or(measured.height),
        )
    }

    /// Typed view of the metadata bag for this block's type
    pub fn payload(&self) -> BlockPayload {
        BlockPayload::decode(self.block_type, &self.data.metadata)
    }
}

/// One entry of a checklist block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChecklistItem {
    pub id: String,
    pub text: String,
    pub checked: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LinkPreview {
    pub url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileAttachment {
    pub file_name: Option<String>,
    pub file_url: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepoStats {
    pub repo: Option<String>,
    pub stars: Option<u64>,
    pub forks: Option<u64>,
    pub open_issues: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContactCard {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Type-specific structured data, decoded from the open metadata bag.
///
/// Decoding never fails: fields that do not match the expected shape fall back to
/// their defaults so one malformed block cannot block a project load.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BlockPayload {
    Text,
    Core,
    Link(LinkPreview),
    File(FileAttachment),
    Github(RepoStats),
    Palette { colors: Vec<String> },
    Contact(ContactCard),
    Video { url: Option<String> },
    Snippet { language: Option<String> },
    Checklist { items: Vec<ChecklistItem> },
    Sketch { strokes: Vec<Value> },
}

impl BlockPayload {
    pub fn decode(block_type: BlockType, metadata: &Map<String, Value>) -> Self {
        fn field<T: serde::de::DeserializeOwned + Default>(
            metadata: &Map<String, Value>,
            key: &str,
        ) -> T {
            metadata
                .get(key)
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default()
        }
        fn whole<T: serde::de::DeserializeOwned + Default>(metadata: &Map<String, Value>) -> T {
            serde_json::from_value(Value::Object(metadata.clone())).unwrap_or_default()
        }

        match block_type {
            BlockType::Text => BlockPayload::Text,
            BlockType::Core => BlockPayload::Core,
            BlockType::Link => BlockPayload::Link(whole(metadata)),
            BlockType::File => BlockPayload::File(whole(metadata)),
            BlockType::Github => BlockPayload::Github(whole(metadata)),
            BlockType::Palette => BlockPayload::Palette {
                colors: field(metadata, "colors"),
            },
            BlockType::Contact => BlockPayload::Contact(whole(metadata)),
            BlockType::Video => BlockPayload::Video {
                url: field(metadata, "url"),
            },
            BlockType::Snippet => BlockPayload::Snippet {
                language: field(metadata, "language"),
            },
            BlockType::Checklist => BlockPayload::Checklist {
                items: field(metadata, "items"),
            },
            BlockType::Sketch => BlockPayload::Sketch {
                strokes: field(metadata, "strokes"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_block_type_parse() {
        assert_eq!(BlockType::parse("text"), Some(BlockType::Text));
        assert_eq!(BlockType::parse(" GitHub "), Some(BlockType::Github));
        assert_eq!(BlockType::parse("spreadsheet"), None);
        for t in BlockType::ALL {
            assert_eq!(BlockType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn test_core_is_pinned_on_creation() {
        let core = Block::new("c", BlockType::Core, Position::new(999.0, -5.0));
        assert_eq!(core.position, Position::anchor());
        assert!(!core.draggable);
        assert!(!core.deletable);
    }

    #[test]
    fn test_effective_size_falls_back_to_type_default() {
        let block = Block::new("a", BlockType::Text, Position::default());
        assert_eq!(block.effective_size(), Dimensions::new(320.0, 240.0));

        let mut measured = block.clone();
        measured.measured = Some(Dimensions::new(200.0, 100.0));
        assert_eq!(measured.effective_size(), Dimensions::new(200.0, 100.0));

        let sized = block.with_size(50.0, 60.0);
        assert_eq!(sized.effective_size(), Dimensions::new(50.0, 60.0));
    }

    #[test]
    fn test_block_deserializes_node_shape() {
        let block: Block = serde_json::from_value(json!({
            "id": "n1",
            "type": "text",
            "position": {"x": 50.0, "y": 60.0},
            "measured": {"width": 200.0, "height": 100.0},
            "data": {"content": "hello", "emoji": "🎉"}
        }))
        .unwrap();

        assert_eq!(block.id, "n1");
        assert_eq!(block.content(), "hello");
        assert!(block.draggable);
        assert_eq!(block.data.extra.get("emoji"), Some(&json!("🎉")));
    }

    #[test]
    fn test_payload_decode_is_lenient() {
        let mut metadata = Map::new();
        metadata.insert("items".into(), json!([{"id": "1", "text": "milk", "checked": true}]));
        let payload = BlockPayload::decode(BlockType::Checklist, &metadata);
        match payload {
            BlockPayload::Checklist { items } => {
                assert_eq!(items.len(), 1);
                assert!(items[0].checked);
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let mut broken = Map::new();
        broken.insert("stars".into(), json!("lots"));
        assert_eq!(
            BlockPayload::decode(BlockType::Github, &broken),
            BlockPayload::Github(RepoStats::default())
        );
    }
}
