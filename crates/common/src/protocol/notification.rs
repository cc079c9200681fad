// Subscriber notification payload.
//
// Create/update notifications carry the full record; deletes carry only the
// record ID because the record may already be gone from the cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{ChangeEvent, ChangeOperation};
use crate::record::Record;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeNotification {
    /// The receiving subscription's ID.
    pub id: String,
    pub operation: ChangeOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    #[serde(rename = "recordId", default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

impl ChangeNotification {
    /// Build the payload for one subscription from a store event.
    pub fn for_subscription<R: Record>(
        subscription_id: &str,
        event: &ChangeEvent<R>,
    ) -> Result<Self, serde_json::Error> {
        let (record, record_id) = match event.operation {
            ChangeOperation::Create | ChangeOperation::Update => {
                (Some(serde_json::to_value(&event.record)?), None)
            }
            ChangeOperation::Delete => (None, Some(event.record.id().to_string())),
        };
        Ok(Self { id: subscription_id.to_string(), operation: event.operation, record, record_id })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;
    use crate::types::{AgentRole, AgentRoleDraft};

    fn role() -> AgentRole {
        AgentRole::from_draft(
            "r1".into(),
            Utc.timestamp_opt(1_700_000_000, 0).single().unwrap(),
            AgentRoleDraft { name: "reviewer".into(), prompt: "Review diffs.".into() },
        )
    }

    #[test]
    fn create_carries_full_record() {
        let event = ChangeEvent::created(role(), 1);
        let n = ChangeNotification::for_subscription("sub-1", &event).unwrap();
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["id"], json!("sub-1"));
        assert_eq!(value["operation"], json!("create"));
        assert_eq!(value["record"]["name"], json!("reviewer"));
        assert!(value.get("recordId").is_none());
    }

    #[test]
    fn delete_carries_only_record_id() {
        let event = ChangeEvent::deleted(role(), 2);
        let n = ChangeNotification::for_subscription("sub-1", &event).unwrap();
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["operation"], json!("delete"));
        assert_eq!(value["recordId"], json!("r1"));
        assert!(value.get("record").is_none());
    }

    #[test]
    fn update_uses_new_value() {
        let before = role();
        let mut after = before.clone();
        after.name = "lead reviewer".into();
        let event = ChangeEvent::updated(before, after, 3);
        let n = ChangeNotification::for_subscription("sub-2", &event).unwrap();
        assert_eq!(n.record.unwrap()["name"], json!("lead reviewer"));
    }
}
