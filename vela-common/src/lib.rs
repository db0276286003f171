//! Wire types shared between `vela-daemon`, `velactl`, and the browser UI.
//!
//! `Request`/`Response` are the JSON-line protocol spoken over the daemon's
//! Unix control socket (see `vela_daemon::control`). `ClientAction` and
//! `ServerMessage` are the JSON object shapes spoken over the WebSocket
//! control/telemetry channel (see `vela_daemon::inputs::web`).

use serde::{Deserialize, Serialize};

/// A command sent to the daemon over its Unix control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "change_level")]
    ChangeLevel { level: u32 },
    #[serde(rename = "set_threshold")]
    SetThreshold { level: u32, value: i64 },
    #[serde(rename = "set_log_level")]
    SetLogLevel { namespace: String, level: String },
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// The daemon's reply to a `Request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "status")]
    Status(DaemonStatus),
}

/// Operator-facing snapshot of the orchestrator, returned by `Request::Status`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonStatus {
    pub levels: Vec<LevelStatus>,
    pub current_level: Option<u32>,
    pub agd_sum: i64,
    pub agd_last_level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelStatus {
    pub level: u32,
    pub bus_name: String,
    pub media: String,
    pub state: String,
}

/// A message sent by a WebSocket client to request an action (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ClientAction {
    #[serde(rename = "change_level")]
    ChangeLevel { level: u32 },
    #[serde(rename = "set_threshold")]
    SetThreshold { level: u32, value: i64 },
    #[serde(rename = "set_log_level")]
    SetLogLevel { namespace: String, level: String },
}

/// A message broadcast by the daemon to every connected WebSocket client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "chart-data")]
    ChartData { ts: String, raw: i64, agd: i64 },
    #[serde(rename = "chart-threshold")]
    ChartThreshold { level: u32, value: i64 },
    #[serde(rename = "log-message")]
    LogMessage { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_change_level_round_trips() {
        let req = Request::ChangeLevel { level: 2 };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"method":"change_level","params":{"level":2}}"#);
        let back: Request = serde_json::from_str(&json).unwrap();
        matches!(back, Request::ChangeLevel { level: 2 });
    }

    #[test]
    fn client_action_parses_spec_examples() {
        let a: ClientAction =
            serde_json::from_str(r#"{"action":"change_level","level":2}"#).unwrap();
        assert!(matches!(a, ClientAction::ChangeLevel { level: 2 }));

        let b: ClientAction =
            serde_json::from_str(r#"{"action":"set_threshold","level":2,"value":25}"#).unwrap();
        assert!(matches!(
            b,
            ClientAction::SetThreshold {
                level: 2,
                value: 25
            }
        ));
    }

    #[test]
    fn server_message_chart_threshold_shape() {
        let msg = ServerMessage::ChartThreshold {
            level: 2,
            value: 25,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "chart-threshold");
        assert_eq!(json["level"], 2);
        assert_eq!(json["value"], 25);
    }
}
