// Copyright 2024 The Warmgate Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};

/// Control messages a worker sends to the gateway over its channel.
///
/// Anything other than `heartbeat` is observability-only; the registry does
/// not change state in response to it. Unknown `type` tags deserialize into
/// [`WorkerMessage::Unknown`] so the connection survives protocol drift on
/// the worker side.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Heartbeat,
    #[serde(rename_all = "camelCase")]
    Status {
        #[serde(default)]
        status: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    UserSessionReady {
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ExecuteResult {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        success: Option<bool>,
    },
    #[serde(other)]
    Unknown,
}

/// Messages the gateway pushes to a worker. Sending is fire-and-forget: a
/// failed enqueue is logged by the caller and never retried.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayToWorker {
    /// Notifies a freshly assigned worker which user/session it now owns.
    #[serde(rename_all = "camelCase")]
    InitUserSession {
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        env: String,
    },
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn inbound_heartbeat_parses() {
        let msg: WorkerMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(msg, WorkerMessage::Heartbeat);
    }

    #[test]
    fn inbound_unknown_type_is_tolerated() {
        let msg: WorkerMessage =
            serde_json::from_str(r#"{"type":"telemetry_blob","payload":42}"#).unwrap();
        assert_eq!(msg, WorkerMessage::Unknown);
    }

    #[test]
    fn init_user_session_wire_shape() {
        let msg = GatewayToWorker::InitUserSession {
            user_id: "alice".to_string(),
            session_id: Some("s-1".to_string()),
            env: "test".to_string(),
        };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            encoded,
            serde_json::json!({
                "type": "init_user_session",
                "userId": "alice",
                "sessionId": "s-1",
                "env": "test",
            })
        );
    }
}
