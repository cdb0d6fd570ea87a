use serde::{Deserialize, Serialize};

use crate::row::{RowError, TableRow};
use crate::vector::Vec2;

/// Maximum accepted length for a player display name.
pub const MAX_PLAYER_NAME_LEN: usize = 64;

/// Stable identifier of an entity for its lifetime.
///
/// Servers disagree on the representation: some issue 64-bit integers,
/// others opaque strings. Both compare and hash structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Num(u64),
    Str(String),
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityId::Num(n) => write!(f, "{}", n),
            EntityId::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for EntityId {
    fn from(n: u64) -> Self {
        EntityId::Num(n)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId::Str(s.to_owned())
    }
}

/// Closed set of entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Player,
    Circle,
    Food,
    Obstacle,
    Other,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Player => "player",
            EntityKind::Circle => "circle",
            EntityKind::Food => "food",
            EntityKind::Obstacle => "obstacle",
            EntityKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> EntityKind {
        match s {
            "player" => EntityKind::Player,
            "circle" => EntityKind::Circle,
            "food" => EntityKind::Food,
            "obstacle" => EntityKind::Obstacle,
            _ => EntityKind::Other,
        }
    }
}

/// Radius derived from mass. Monotonic; identical on every server dialect.
pub fn radius_from_mass(mass: f64) -> f64 {
    mass.max(0.0).sqrt()
}

/// A positioned object in the game world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: EntityId,
    pub position: Vec2,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<Vec2>,
    pub mass: f64,
    pub kind: EntityKind,
    /// Player id of the owner, when the entity belongs to a player.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<u64>,
}

impl Entity {
    pub fn radius(&self) -> f64 {
        radius_from_mass(self.mass)
    }
}

impl TryFrom<&TableRow> for Entity {
    type Error = RowError;

    fn try_from(row: &TableRow) -> Result<Self, RowError> {
        let entity_id = parse_entity_id(row, "entity_id")?;
        let mass = row.require_f64("mass")?;
        if mass < 0.0 {
            return Err(RowError::OutOfRange {
                row_id: row.describe_id(),
                field: "mass".to_owned(),
                message: format!("must be non-negative, got {}", mass),
            });
        }
        let kind = EntityKind::parse(row.require_str("kind")?);
        let owner_id = match row.get("owner_id") {
            None | Some(serde_json::Value::Null) => None,
            Some(v) => Some(v.as_u64().ok_or_else(|| RowError::TypeMismatch {
                row_id: row.describe_id(),
                field: "owner_id".to_owned(),
                expected: "unsigned integer".to_owned(),
            })?),
        };
        Ok(Entity {
            entity_id,
            position: row.require_vec2("position")?,
            velocity: row.optional_vec2("velocity")?,
            mass,
            kind,
            owner_id,
        })
    }
}

/// Lifecycle state of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    Joining,
    Active,
    Splitting,
    Left,
}

impl PlayerState {
    pub fn parse(s: &str) -> Option<PlayerState> {
        match s {
            "joining" => Some(PlayerState::Joining),
            "active" => Some(PlayerState::Active),
            "splitting" => Some(PlayerState::Splitting),
            "left" => Some(PlayerState::Left),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerState::Joining => "joining",
            PlayerState::Active => "active",
            PlayerState::Splitting => "splitting",
            PlayerState::Left => "left",
        }
    }
}

/// A player: an [`Entity`] specialization with identity and score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub entity_id: EntityId,
    pub player_id: u64,
    pub name: String,
    /// Binding to the authenticated identity that owns this player.
    pub identity_id: String,
    pub position: Vec2,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<Vec2>,
    pub mass: f64,
    pub score: u64,
    pub state: PlayerState,
    /// Microseconds since the Unix epoch.
    pub created_at: i64,
}

impl Player {
    pub fn radius(&self) -> f64 {
        radius_from_mass(self.mass)
    }
}

impl TryFrom<&TableRow> for Player {
    type Error = RowError;

    fn try_from(row: &TableRow) -> Result<Self, RowError> {
        let name = row.require_str("name")?;
        if name.is_empty() || name.len() > MAX_PLAYER_NAME_LEN {
            return Err(RowError::OutOfRange {
                row_id: row.describe_id(),
                field: "name".to_owned(),
                message: format!("length must be 1..={}", MAX_PLAYER_NAME_LEN),
            });
        }
        let state_str = row.require_str("state")?;
        let state = PlayerState::parse(state_str).ok_or_else(|| RowError::TypeMismatch {
            row_id: row.describe_id(),
            field: "state".to_owned(),
            expected: "player state".to_owned(),
        })?;
        let mass = row.require_f64("mass")?;
        if mass < 0.0 {
            return Err(RowError::OutOfRange {
                row_id: row.describe_id(),
                field: "mass".to_owned(),
                message: format!("must be non-negative, got {}", mass),
            });
        }
        Ok(Player {
            entity_id: parse_entity_id(row, "entity_id")?,
            player_id: row.require_u64("player_id")?,
            name: name.to_owned(),
            identity_id: row.require_str("identity_id")?.to_owned(),
            position: row.require_vec2("position")?,
            velocity: row.optional_vec2("velocity")?,
            mass,
            score: row.require_u64("score")?,
            state,
            created_at: row.require_i64("created_at")?,
        })
    }
}

/// A consumable or powerup: an [`Entity`] specialization with a kind tag
/// from a closed set (at minimum `"food"`) and an integer value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    pub entity_id: EntityId,
    pub position: Vec2,
    pub mass: f64,
    pub circle_kind: String,
    pub value: i64,
}

impl Circle {
    pub fn radius(&self) -> f64 {
        radius_from_mass(self.mass)
    }

    pub fn is_food(&self) -> bool {
        self.circle_kind == "food"
    }
}

impl TryFrom<&TableRow> for Circle {
    type Error = RowError;

    fn try_from(row: &TableRow) -> Result<Self, RowError> {
        let mass = row.require_f64("mass")?;
        if mass < 0.0 {
            return Err(RowError::OutOfRange {
                row_id: row.describe_id(),
                field: "mass".to_owned(),
                message: format!("must be non-negative, got {}", mass),
            });
        }
        Ok(Circle {
            entity_id: parse_entity_id(row, "entity_id")?,
            position: row.require_vec2("position")?,
            mass,
            circle_kind: row.require_str("circle_kind")?.to_owned(),
            value: row.require_i64("value")?,
        })
    }
}

fn parse_entity_id(row: &TableRow, field: &str) -> Result<EntityId, RowError> {
    match row.get(field) {
        Some(serde_json::Value::Number(n)) if n.as_u64().is_some() => {
            Ok(EntityId::Num(n.as_u64().unwrap()))
        }
        Some(serde_json::Value::String(s)) => Ok(EntityId::Str(s.clone())),
        Some(_) => Err(RowError::TypeMismatch {
            row_id: row.describe_id(),
            field: field.to_owned(),
            expected: "string or unsigned integer".to_owned(),
        }),
        None => Err(RowError::MissingField {
            row_id: row.describe_id(),
            field: field.to_owned(),
        }),
    }
}
