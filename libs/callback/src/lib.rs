//! Push HTTP callback client.
//!
//! Before a push is dispatched, the push consumer may ask an operator
//! endpoint to approve or rewrite it: `POST {url}?callbackCommand={command}`
//! with a JSON body, answered by
//! `{"actionCode": .., "errCode": .., "errMsg": .., "nextCode": .., ...}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const ONLINE_PUSH_COMMAND: &str = "callbackBeforeOnlinePushCommand";

// ═══════════════════════════════════════════════════════════════
//  Config
// ═══════════════════════════════════════════════════════════════

fn default_timeout_secs() -> u64 {
    5
}

/// `[callback]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// `false`: a transport or parse failure lets the push continue with the
    /// original data. `true`: the failure aborts that push attempt.
    #[serde(default)]
    pub fail_closed: bool,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            enable: false,
            url: String::new(),
            timeout_secs: default_timeout_secs(),
            fail_closed: false,
        }
    }
}

impl CallbackConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enable && self.url.is_empty() {
            return Err("callback.url is required when callback.enable = true".into());
        }
        if self.timeout_secs == 0 {
            return Err("callback.timeout_secs must be positive".into());
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Wire types
// ═══════════════════════════════════════════════════════════════

/// Body sent before an online or offline push.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeforePushRequest {
    pub callback_command: String,
    #[serde(rename = "operationID")]
    pub operation_id: String,
    #[serde(rename = "userIDList")]
    pub user_id_list: Vec<String>,
    #[serde(rename = "clientMsgID")]
    pub client_msg_id: String,
    #[serde(rename = "sendID")]
    pub send_id: String,
    #[serde(rename = "groupID")]
    pub group_id: String,
    pub content_type: i32,
    pub session_type: i32,
    #[serde(rename = "atUserIDList", skip_serializing_if = "Vec::is_empty")]
    pub at_user_ids: Vec<String>,
    pub content: String,
}

impl BeforePushRequest {
    /// Take over the receivers the endpoint sent back, if any.
    /// Returns whether the target list changed.
    pub fn apply(&mut self, resp: &CallbackResponse) -> bool {
        match resp.user_ids() {
            Some(ids) if ids != self.user_id_list => {
                self.user_id_list = ids;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    #[serde(default)]
    pub action_code: i32,
    #[serde(default)]
    pub err_code: i32,
    #[serde(default)]
    pub err_msg: String,
    #[serde(default)]
    pub next_code: i32,
    /// Command-specific fields (e.g. a rewritten user list).
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl CallbackResponse {
    /// Rewritten receiver list (`userIDList`). An absent, empty or
    /// non-string list means "keep the original receivers".
    pub fn user_ids(&self) -> Option<Vec<String>> {
        let ids: Vec<String> = self
            .data
            .get("userIDList")?
            .as_array()?
            .iter()
            .map(|v| v.as_str().map(str::to_owned))
            .collect::<Option<_>>()?;
        (!ids.is_empty()).then_some(ids)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Outcome / errors
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    /// Callbacks are off; no request was made.
    Disabled,
    Accepted(CallbackResponse),
    /// The callback failed but `fail_closed = false`: proceed with original data.
    Continue,
}

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("callback network error: {0}")]
    Network(String),

    #[error("callback response malformed: {0}")]
    Data(String),

    #[error("callback rejected: errCode={code} errMsg={msg}")]
    Rejected { code: i32, msg: String },

    #[error("callback client: {0}")]
    Client(String),
}

// ═══════════════════════════════════════════════════════════════
//  Client
// ═══════════════════════════════════════════════════════════════

pub struct CallbackClient {
    http: reqwest::Client,
    config: CallbackConfig,
}

impl CallbackClient {
    pub fn new(config: CallbackConfig) -> Result<Self, CallbackError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CallbackError::Client(format!("HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    /// POST `req` under `command`.
    pub async fn post<T: Serialize + ?Sized>(
        &self,
        command: &str,
        req: &T,
    ) -> Result<CallbackOutcome, CallbackError> {
        if !self.config.enable {
            return Ok(CallbackOutcome::Disabled);
        }

        let sent = self
            .http
            .post(&self.config.url)
            .query(&[("callbackCommand", command)])
            .json(req)
            .send()
            .await;

        let body = match sent {
            Ok(resp) => resp.bytes().await,
            Err(e) => Err(e),
        };
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(command, url = %self.config.url, error = %e, "callback request failed");
                return self.on_failure(CallbackError::Network(e.to_string()));
            }
        };

        parse_response(&body, self.config.fail_closed)
    }

    pub async fn before_online_push(
        &self,
        req: &BeforePushRequest,
    ) -> Result<CallbackOutcome, CallbackError> {
        self.post(ONLINE_PUSH_COMMAND, req).await
    }

    fn on_failure(&self, err: CallbackError) -> Result<CallbackOutcome, CallbackError> {
        if self.config.fail_closed {
            Err(err)
        } else {
            Ok(CallbackOutcome::Continue)
        }
    }
}

/// Interpret a callback response body.
pub fn parse_response(body: &[u8], fail_closed: bool) -> Result<CallbackOutcome, CallbackError> {
    let resp: CallbackResponse = match serde_json::from_slice(body) {
        Ok(resp) => resp,
        Err(e) if fail_closed => return Err(CallbackError::Data(e.to_string())),
        Err(e) => {
            tracing::warn!(error = %e, "callback response unreadable, continuing");
            return Ok(CallbackOutcome::Continue);
        }
    };
    if resp.err_code != 0 {
        return Err(CallbackError::Rejected { code: resp.err_code, msg: resp.err_msg });
    }
    Ok(CallbackOutcome::Accepted(resp))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enable: bool, fail_closed: bool) -> CallbackConfig {
        CallbackConfig {
            enable,
            // Nothing listens on port 1.
            url: "http://127.0.0.1:1/callback".into(),
            timeout_secs: 2,
            fail_closed,
        }
    }

    #[test]
    fn accepted_response_keeps_extra_fields() {
        let out = parse_response(
            br#"{"actionCode":0,"errCode":0,"errMsg":"","nextCode":1,"userIDList":["u2"]}"#,
            true,
        )
        .unwrap();
        let CallbackOutcome::Accepted(resp) = out else {
            panic!("expected accepted, got {out:?}");
        };
        assert_eq!(resp.next_code, 1);
        assert_eq!(resp.data["userIDList"], serde_json::json!(["u2"]));
    }

    #[test]
    fn rewritten_user_list_replaces_receivers() {
        let mut req = BeforePushRequest { user_id_list: vec!["u2".into()], ..BeforePushRequest::default() };

        let keep = parse_response(br#"{"errCode":0,"userIDList":[]}"#, true).unwrap();
        let CallbackOutcome::Accepted(keep) = keep else { panic!("expected accepted") };
        assert_eq!(keep.user_ids(), None);
        assert!(!req.apply(&keep));
        assert_eq!(req.user_id_list, vec!["u2".to_string()]);

        let odd = parse_response(br#"{"errCode":0,"userIDList":["u3",7]}"#, true).unwrap();
        let CallbackOutcome::Accepted(odd) = odd else { panic!("expected accepted") };
        assert!(!req.apply(&odd));

        let rewrite = parse_response(br#"{"errCode":0,"userIDList":["u3","u4"]}"#, true).unwrap();
        let CallbackOutcome::Accepted(rewrite) = rewrite else { panic!("expected accepted") };
        assert!(req.apply(&rewrite));
        assert_eq!(req.user_id_list, vec!["u3".to_string(), "u4".to_string()]);
        assert!(!req.apply(&rewrite));
    }

    #[test]
    fn err_code_is_always_rejected() {
        for fail_closed in [false, true] {
            let err = parse_response(br#"{"errCode":5001,"errMsg":"blocked"}"#, fail_closed).unwrap_err();
            assert!(matches!(err, CallbackError::Rejected { code: 5001, .. }));
        }
    }

    #[test]
    fn garbage_body_depends_on_fail_closed() {
        assert_eq!(parse_response(b"<html>", false).unwrap(), CallbackOutcome::Continue);
        assert!(matches!(parse_response(b"<html>", true), Err(CallbackError::Data(_))));
    }

    #[test]
    fn enabled_without_url_is_invalid() {
        let cfg = CallbackConfig { enable: true, ..CallbackConfig::default() };
        assert!(cfg.validate().is_err());
        assert!(CallbackConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn disabled_makes_no_request() {
        let client = CallbackClient::new(config(false, true)).unwrap();
        let out = client.before_online_push(&BeforePushRequest::default()).await.unwrap();
        assert_eq!(out, CallbackOutcome::Disabled);
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_open() {
        let client = CallbackClient::new(config(true, false)).unwrap();
        let out = client.post(ONLINE_PUSH_COMMAND, &serde_json::json!({})).await.unwrap();
        assert_eq!(out, CallbackOutcome::Continue);
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_closed() {
        let client = CallbackClient::new(config(true, true)).unwrap();
        let err = client.post(ONLINE_PUSH_COMMAND, &serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, CallbackError::Network(_)));
    }
}
