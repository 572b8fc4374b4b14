//! Remote block model.
//!
//! A block is kept close to the wire format: a type tag plus the JSON payload
//! stored under the key of the same name.  Only the rich-text portion of the
//! payload is interpreted locally (see [`Block::plain_text`]); everything
//! else is carried through untouched.

use serde_json::{Map, Value, json};

/// Remote limit on the length of a single rich-text segment.
pub const RICH_TEXT_LIMIT: usize = 2000;

/// Block types that hold other pages rather than page content.
const CONTAINER_KINDS: &[&str] = &["child_page", "child_database"];

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Assigned by the remote store; `None` for blocks that only exist locally.
    pub id: Option<String>,
    /// Type tag, e.g. `paragraph` or `heading_1`.
    pub kind: String,
    /// Type-specific payload.
    pub payload: Value,
}

impl Block {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            payload,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// A block whose payload is just a rich-text run of `text`.
    pub fn text(kind: impl Into<String>, text: &str) -> Self {
        Self::new(kind, json!({ "rich_text": rich_text(text) }))
    }

    pub fn paragraph(text: &str) -> Self {
        Self::text("paragraph", text)
    }

    pub fn heading(level: u8, text: &str) -> Self {
        let level = level.clamp(1, 3);
        Self::text(format!("heading_{level}"), text)
    }

    pub fn bulleted(text: &str) -> Self {
        Self::text("bulleted_list_item", text)
    }

    pub fn numbered(text: &str) -> Self {
        Self::text("numbered_list_item", text)
    }

    pub fn quote(text: &str) -> Self {
        Self::text("quote", text)
    }

    pub fn to_do(text: &str, checked: bool) -> Self {
        Self::new(
            "to_do",
            json!({ "rich_text": rich_text(text), "checked": checked }),
        )
    }

    pub fn code(language: &str, text: &str) -> Self {
        Self::new(
            "code",
            json!({ "rich_text": rich_text(text), "language": language }),
        )
    }

    pub fn divider() -> Self {
        Self::new("divider", json!({}))
    }

    pub fn child_page(title: &str) -> Self {
        Self::new("child_page", json!({ "title": title }))
    }

    /// Parse a block object as returned by the list-children endpoint.
    /// Returns `None` for objects without a type tag.
    pub fn from_json(value: &Value) -> Option<Self> {
        let kind = value.get("type")?.as_str()?.to_string();
        let payload = value.get(&kind).cloned().unwrap_or_else(|| json!({}));
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        Some(Self { id, kind, payload })
    }

    /// Serialize in the shape accepted by create/append requests.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        object.insert("object".to_string(), json!("block"));
        object.insert("type".to_string(), json!(self.kind));
        object.insert(self.kind.clone(), self.payload.clone());
        Value::Object(object)
    }

    /// Concatenated plain text of the payload's rich-text run.  Blocks
    /// without rich text yield an empty string.
    pub fn plain_text(&self) -> String {
        self.payload
            .get("rich_text")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(segment_text).collect())
            .unwrap_or_default()
    }

    /// Title of a `child_page` block.
    pub fn child_title(&self) -> Option<&str> {
        if self.kind != "child_page" {
            return None;
        }
        self.payload.get("title").and_then(Value::as_str)
    }

    pub fn is_container(&self) -> bool {
        CONTAINER_KINDS.contains(&self.kind.as_str())
    }

    /// Identity used by the differ: same type tag and same visible text.
    pub fn matches(&self, other: &Block) -> bool {
        self.kind == other.kind && self.plain_text() == other.plain_text()
    }
}

/// Responses carry `plain_text`; request bodies we built ourselves only carry
/// `text.content`.  Accept either.
fn segment_text(segment: &Value) -> &str {
    segment
        .get("plain_text")
        .and_then(Value::as_str)
        .or_else(|| {
            segment
                .get("text")
                .and_then(|text| text.get("content"))
                .and_then(Value::as_str)
        })
        .unwrap_or("")
}

/// Build a rich-text array for `text`, split into segments that respect
/// [`RICH_TEXT_LIMIT`] (counted in chars).
pub fn rich_text(text: &str) -> Value {
    if text.is_empty() {
        return json!([]);
    }
    let chars = text.chars().collect::<Vec<_>>();
    let segments = chars
        .chunks(RICH_TEXT_LIMIT)
        .map(|chunk| {
            let content = chunk.iter().collect::<String>();
            json!({ "type": "text", "text": { "content": content } })
        })
        .collect::<Vec<_>>();
    Value::Array(segments)
}

/// `true` when the remote object is archived or in the trash.
pub fn is_archived(value: &Value) -> bool {
    let flag = |key: &str| value.get(key).and_then(Value::as_bool).unwrap_or(false);
    flag("archived") || flag("in_trash")
}
