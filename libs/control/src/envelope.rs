use serde::{Deserialize, Serialize};

/// Generic notification wrapper carried in a control message's content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEnvelope {
    /// Kind-specific payload; base64 on the wire.
    #[serde(with = "msg_api::util::base64_bytes", default)]
    pub detail: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_tips: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub json_detail: String,
}

impl NotificationEnvelope {
    pub fn decode(content: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(content)
    }

    /// Producer-side helper: serialize `detail` and wrap it.
    pub fn wrap<T: Serialize>(detail: &T) -> Result<Vec<u8>, serde_json::Error> {
        let envelope = NotificationEnvelope {
            detail: serde_json::to_vec(detail)?,
            ..Default::default()
        };
        serde_json::to_vec(&envelope)
    }
}

/// Detail of a deletion notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMessageTips {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(default)]
    pub seqs: Vec<u64>,
}

impl DeleteMessageTips {
    pub fn decode(detail: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(detail)
    }
}
