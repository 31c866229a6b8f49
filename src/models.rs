use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// --- Scene entities ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Token {
    pub id: String,
    pub x: f64,
    pub y: f64,
    #[serde(default = "default_token_name")]
    pub name: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default = "default_size_scale")]
    pub size_scale: f64,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub badges: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Map,
    #[default]
    Draw,
    Notes,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Stroke {
    pub id: String,
    #[serde(default)]
    pub points: Vec<Point>,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_line_width")]
    pub width: f64,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub layer: Layer,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Rect,
    Circle,
    Line,
}

impl ShapeKind {
    /// Parse the wire name of a shape kind (`rect` / `circle` / `line`).
    pub fn parse(raw: &str) -> Option<ShapeKind> {
        match raw {
            "rect" => Some(ShapeKind::Rect),
            "circle" => Some(ShapeKind::Circle),
            "line" => Some(ShapeKind::Line),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Shape {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ShapeKind,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_line_width")]
    pub width: f64,
    #[serde(default)]
    pub fill: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub layer: Layer,
}

// --- Room state ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundMode {
    #[default]
    Solid,
    Url,
    Terrain,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TerrainStyle {
    #[default]
    Grassland,
    Dirt,
    Snow,
    Desert,
}

/// Back-to-front paint order for strokes and shapes. The last id in each
/// list paints on top.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DrawOrder {
    #[serde(default)]
    pub strokes: Vec<String>,
    #[serde(default)]
    pub shapes: Vec<String>,
}

/// The authoritative document for one room. Persisted as a single JSON blob;
/// `gm_key_hash` is part of the blob but never sent to clients.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RoomState {
    pub room_id: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub gm_id: Option<String>,
    #[serde(default)]
    pub gm_user_id: Option<String>,
    #[serde(default)]
    pub allow_players_move: bool,
    #[serde(default)]
    pub allow_all_move: bool,
    #[serde(default)]
    pub lockdown: bool,
    #[serde(default)]
    pub gm_key_hash: Option<String>,
    #[serde(default)]
    pub background_mode: BackgroundMode,
    #[serde(default)]
    pub background_url: Option<String>,
    #[serde(default = "default_terrain_seed")]
    pub terrain_seed: i64,
    #[serde(default)]
    pub terrain_style: TerrainStyle,
    #[serde(default = "default_layer_visibility")]
    pub layer_visibility: HashMap<String, bool>,
    #[serde(default)]
    pub tokens: HashMap<String, Token>,
    #[serde(default)]
    pub strokes: HashMap<String, Stroke>,
    #[serde(default)]
    pub shapes: HashMap<String, Shape>,
    #[serde(default)]
    pub draw_order: DrawOrder,
}

impl RoomState {
    /// Blank state for a freshly created (or unrecoverable) room.
    pub fn blank(room_id: &str) -> Self {
        RoomState {
            room_id: room_id.to_string(),
            version: 0,
            gm_id: None,
            gm_user_id: None,
            allow_players_move: false,
            allow_all_move: false,
            lockdown: false,
            gm_key_hash: None,
            background_mode: BackgroundMode::default(),
            background_url: None,
            terrain_seed: default_terrain_seed(),
            terrain_style: TerrainStyle::default(),
            layer_visibility: default_layer_visibility(),
            tokens: HashMap::new(),
            strokes: HashMap::new(),
            shapes: HashMap::new(),
            draw_order: DrawOrder::default(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("room state serializes")
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// State as sent to clients: everything except `gm_key_hash`.
    pub fn client_view(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).expect("room state serializes");
        if let Some(map) = value.as_object_mut() {
            map.remove("gm_key_hash");
        }
        value
    }

    /// Rewrite both draw-order lists so each is the existing order filtered
    /// to ids that still exist, with unlisted ids appended in insertion
    /// order. Run on load, import/restore, and undo/redo.
    pub fn normalize_order(&mut self) {
        let strokes = &self.strokes;
        self.draw_order.strokes.retain(|id| strokes.contains_key(id));
        let shapes = &self.shapes;
        self.draw_order.shapes.retain(|id| shapes.contains_key(id));
        for id in self.strokes.keys() {
            if !self.draw_order.strokes.iter().any(|x| x == id) {
                self.draw_order.strokes.push(id.clone());
            }
        }
        for id in self.shapes.keys() {
            if !self.draw_order.shapes.iter().any(|x| x == id) {
                self.draw_order.shapes.push(id.clone());
            }
        }
    }

    /// Move a stroke id to the top of the paint order (appending if new).
    pub fn append_stroke_order(&mut self, id: &str) {
        self.normalize_order();
        self.draw_order.strokes.retain(|x| x != id);
        self.draw_order.strokes.push(id.to_string());
    }

    pub fn remove_stroke_order(&mut self, id: &str) {
        self.draw_order.strokes.retain(|x| x != id);
    }

    /// Move a shape id to the top of the paint order (appending if new).
    pub fn append_shape_order(&mut self, id: &str) {
        self.normalize_order();
        self.draw_order.shapes.retain(|x| x != id);
        self.draw_order.shapes.push(id.to_string());
    }

    pub fn remove_shape_order(&mut self, id: &str) {
        self.draw_order.shapes.retain(|x| x != id);
    }
}

// --- Defaults ---

fn default_token_name() -> String {
    "Token".to_string()
}

fn default_color() -> String {
    "#ffffff".to_string()
}

fn default_size_scale() -> f64 {
    1.0
}

fn default_line_width() -> f64 {
    3.0
}

fn default_terrain_seed() -> i64 {
    1
}

fn default_layer_visibility() -> HashMap<String, bool> {
    let mut layers = HashMap::new();
    layers.insert("grid".to_string(), true);
    layers.insert("drawings".to_string(), true);
    layers.insert("shapes".to_string(), true);
    layers.insert("tokens".to_string(), true);
    layers
}
