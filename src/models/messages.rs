use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::InstanceId;

/// Message exchanged between tabs of one browser over the local broadcast
/// channel. Ephemeral: never persisted, only delivered to tabs that are
/// subscribed at send time.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TabMessage {
    #[serde(flatten)]
    pub payload: TabPayload,
    pub document_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub sender_instance_id: InstanceId,
}

impl TabMessage {
    pub fn new(
        payload: TabPayload,
        document_id: Option<String>,
        sender_instance_id: InstanceId,
    ) -> Self {
        Self {
            payload,
            document_id,
            timestamp: Utc::now(),
            sender_instance_id,
        }
    }

    pub fn kind(&self) -> TabMessageKind {
        self.payload.kind()
    }
}

/// Type-dependent payload of a tab message
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum TabPayload {
    /// Optimistic partial-document change made by the sender
    FormUpdate { form: serde_json::Value },
    /// Optimistic change of a single field made by the sender
    FieldUpdate {
        field_id: String,
        field: serde_json::Value,
    },
    /// Ask sibling tabs for their in-memory state of a document
    FormSyncRequest,
    /// Answer to a sync request, carrying the responder's in-memory state
    FormSyncResponse { state: serde_json::Value },
    /// The sender is foregrounded (or announcing it is still alive)
    TabActive,
    /// The sender went to the background or is closing
    TabInactive,
}

impl TabPayload {
    pub fn kind(&self) -> TabMessageKind {
        match self {
            TabPayload::FormUpdate { .. } => TabMessageKind::FormUpdate,
            TabPayload::FieldUpdate { .. } => TabMessageKind::FieldUpdate,
            TabPayload::FormSyncRequest => TabMessageKind::FormSyncRequest,
            TabPayload::FormSyncResponse { .. } => TabMessageKind::FormSyncResponse,
            TabPayload::TabActive => TabMessageKind::TabActive,
            TabPayload::TabInactive => TabMessageKind::TabInactive,
        }
    }
}

/// Message discriminant, used as the key of the handler registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TabMessageKind {
    FormUpdate,
    FieldUpdate,
    FormSyncRequest,
    FormSyncResponse,
    TabActive,
    TabInactive,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_update_serializes_with_type_tag() {
        let msg = TabMessage::new(
            TabPayload::FieldUpdate {
                field_id: "field-7".to_string(),
                field: serde_json::json!({"value": "x"}),
            },
            Some("form-2".to_string()),
            InstanceId::generate(),
        );

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "FIELD_UPDATE");
        assert_eq!(json["fieldId"], "field-7");
        assert_eq!(json["field"]["value"], "x");
        assert_eq!(json["documentId"], "form-2");
        assert!(json["senderInstanceId"].is_string());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn presence_messages_round_trip() {
        let msg = TabMessage::new(TabPayload::TabActive, None, InstanceId::generate());
        let json = serde_json::to_string(&msg).unwrap();
        let back: TabMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), TabMessageKind::TabActive);
        assert!(back.document_id.is_none());
    }
}
