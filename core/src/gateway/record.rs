/// Backend row shapes and their mapping onto `Message`
///
/// Depending on the query, the backend returns the joined user rows nested
/// (`sender`/`receiver`), only the sender flattened as `usuario`, or no join
/// at all. All of that is resolved here and nowhere else.
use crate::error::{ChatError, Result};
use crate::messenger_types::{DeliveryState, Message, MessageId, Participant, Role};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row identifiers come back as numbers or strings depending on the column type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowId {
    Int(i64),
    Text(String),
}

impl RowId {
    fn into_string(self) -> String {
        match self {
            RowId::Int(n) => n.to_string(),
            RowId::Text(s) => s,
        }
    }
}

/// Joined `usuarios` row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub nombre: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub rol: Option<Role>,
}

impl UserRow {
    fn into_participant(self, fallback_id: &str) -> Participant {
        Participant {
            id: self.id.unwrap_or_else(|| fallback_id.to_string()),
            display_name: self.nombre,
            email: self.email,
            role: self.rol,
        }
    }
}

/// Row of the `mensajes_chat` table, optionally with user joins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: RowId,
    pub contenido: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<UserRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usuario: Option<UserRow>,
}

impl MessageRow {
    /// Parse one row from the backend's JSON payload
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = ChatError;

    fn try_from(row: MessageRow) -> Result<Self> {
        let created_at = parse_timestamp(&row.created_at)?;
        // nested join wins over the flattened sender
        let sender = row
            .sender
            .or(row.usuario)
            .map(|u| u.into_participant(&row.sender_id));
        let receiver = row.receiver.map(|u| u.into_participant(&row.receiver_id));

        Ok(Message {
            id: MessageId::new(row.id.into_string()),
            body: row.contenido,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            created_at,
            sender,
            receiver,
            delivery: DeliveryState::Confirmed,
        })
    }
}

/// Map a batch of rows, dropping (and logging) rows that do not parse
pub fn map_rows(rows: Vec<MessageRow>) -> Vec<Message> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.id.clone();
            match Message::try_from(row) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    tracing::warn!("Skipping malformed message row {:?}: {}", id, e);
                    None
                }
            }
        })
        .collect()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    // timestamp columns without zone are UTC
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| ChatError::Gateway(format!("invalid created_at '{}': {}", raw, e)))
}
