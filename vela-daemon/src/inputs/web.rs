//! WebSocket control/telemetry adapter (spec §4.8, §6 "WebSocket control").
//!
//! Grounded on the teacher's `main.rs` Unix-socket JSON protocol for the
//! request/response shape, and on `alfredjeanlab-oddjobs`'s
//! `agent::coop::ws::event_bridge` for bridging a WebSocket stream into an
//! internal event channel with `tokio::select!`-based fan-in of multiple
//! bus subscriptions.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use vela_common::{ClientAction, ServerMessage};

use crate::bus::{AgdSample, Bus, LevelChangeRequest, LogRecord, SetThresholdRequest, ThresholdChanged};
use crate::error::{Result, VelaError};
use crate::logging::LogController;

#[derive(Clone)]
struct WebState {
    bus: Arc<Bus>,
    log_controller: Arc<LogController>,
}

pub async fn run(bind: &str, bus: Arc<Bus>, log_controller: Arc<LogController>) -> Result<()> {
    let app = Router::new()
        .route("/ws", get(handle_upgrade))
        .with_state(WebState { bus, log_controller });

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| VelaError::DeviceOpenFailed {
            name: "web".into(),
            reason: e.to_string(),
        })?;
    info!(bind, "web control input listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| VelaError::DeviceOpenFailed {
            name: "web".into(),
            reason: e.to_string(),
        })
}

async fn handle_upgrade(ws: WebSocketUpgrade, State(state): State<WebState>) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.bus, state.log_controller))
}

async fn handle_socket(socket: WebSocket, bus: Arc<Bus>, log_controller: Arc<LogController>) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(64);

    let agd_tx = out_tx.clone();
    let agd_token = bus
        .agd_output
        .attach_tracked(move |sample: AgdSample| {
            let agd_tx = agd_tx.clone();
            async move {
                let _ = agd_tx
                    .send(ServerMessage::ChartData {
                        ts: now_iso8601(),
                        raw: sample.raw as i64,
                        agd: sample.agd,
                    })
                    .await;
                Ok(())
            }
        })
        .await;

    let threshold_tx = out_tx.clone();
    let threshold_token = bus
        .threshold_changed
        .attach_tracked(move |changed: ThresholdChanged| {
            let threshold_tx = threshold_tx.clone();
            async move {
                let _ = threshold_tx
                    .send(ServerMessage::ChartThreshold {
                        level: changed.level as u32,
                        value: changed.value,
                    })
                    .await;
                Ok(())
            }
        })
        .await;

    let log_tx = out_tx.clone();
    let log_token = bus
        .log_message
        .attach_tracked(move |record: LogRecord| {
            let log_tx = log_tx.clone();
            async move {
                // spec §6: "L SS.mmmmmm NS TEXT".
                let message = format!(
                    "{} {:02}.{:06} {} {}",
                    record.level_letter, record.seconds, record.micros, record.namespace, record.text
                );
                let _ = log_tx.send(ServerMessage::LogMessage { message }).await;
                Ok(())
            }
        })
        .await;

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                let Some(message) = outgoing else { break };
                let Ok(text) = serde_json::to_string(&message) else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_action(&text, &bus, &log_controller).await
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "web control: websocket read error");
                        break;
                    }
                }
            }
        }
    }

    bus.agd_output.detach(agd_token).await;
    bus.threshold_changed.detach(threshold_token).await;
    bus.log_message.detach(log_token).await;
}

async fn handle_client_action(text: &str, bus: &Arc<Bus>, log_controller: &Arc<LogController>) {
    let action: ClientAction = match serde_json::from_str(text) {
        Ok(action) => action,
        Err(e) => {
            warn!(error = %e, text, "web control: unparseable client action");
            return;
        }
    };

    match action {
        ClientAction::ChangeLevel { level } => {
            bus.change_play_level
                .publish(LevelChangeRequest { level, source: "web" })
                .await;
        }
        ClientAction::SetThreshold { level, value } => {
            bus.set_threshold_request
                .publish(SetThresholdRequest {
                    level: level as usize,
                    value,
                })
                .await;
        }
        ClientAction::SetLogLevel { namespace, level } => {
            if let Err(e) = log_controller.set_level(&namespace, &level).await {
                warn!(namespace, level, error = %e, "web control: set_log_level failed");
            } else {
                info!(namespace, level, "web control: log level updated");
            }
        }
    }
}

fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn test_log_controller() -> Arc<LogController> {
        let (layer, handle) = tracing_subscriber::reload::Layer::new(tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry().with(layer);
        Arc::new(LogController::new(handle, "warn".to_string()))
    }

    #[tokio::test]
    async fn change_level_action_publishes_on_bus() {
        let bus = Arc::new(Bus::default());
        let log_controller = test_log_controller();
        let received = Arc::new(tokio::sync::Mutex::new(None));
        let received2 = received.clone();
        bus.change_play_level
            .attach(move |req| {
                let received2 = received2.clone();
                async move {
                    *received2.lock().await = Some(req);
                    Ok(())
                }
            })
            .await;

        handle_client_action(r#"{"action":"change_level","level":2}"#, &bus, &log_controller).await;

        assert_eq!(
            *received.lock().await,
            Some(LevelChangeRequest { level: 2, source: "web" })
        );
    }

    #[tokio::test]
    async fn set_log_level_action_reconfigures_the_filter() {
        let bus = Arc::new(Bus::default());
        let log_controller = test_log_controller();

        handle_client_action(
            r#"{"action":"set_log_level","namespace":"vela_daemon::player","level":"debug"}"#,
            &bus,
            &log_controller,
        )
        .await;

        // A second, independent namespace override must still apply cleanly
        // on top of the first.
        handle_client_action(
            r#"{"action":"set_log_level","namespace":"vela_daemon::agd","level":"trace"}"#,
            &bus,
            &log_controller,
        )
        .await;
    }

    #[tokio::test]
    async fn log_message_is_formatted_as_level_timestamp_namespace_text() {
        let bus = Arc::new(Bus::default());
        let (tx, mut rx) = mpsc::channel::<ServerMessage>(1);
        bus.log_message
            .attach(move |record: LogRecord| {
                let tx = tx.clone();
                async move {
                    let message = format!(
                        "{} {:02}.{:06} {} {}",
                        record.level_letter, record.seconds, record.micros, record.namespace, record.text
                    );
                    let _ = tx.send(ServerMessage::LogMessage { message }).await;
                    Ok(())
                }
            })
            .await;

        bus.log_message
            .publish(LogRecord {
                level_letter: 'W',
                seconds: 7,
                micros: 123456,
                namespace: "vela_daemon::player".to_string(),
                text: "spawn failed".to_string(),
            })
            .await;

        let ServerMessage::LogMessage { message } = rx.recv().await.unwrap() else {
            panic!("expected a LogMessage");
        };
        assert_eq!(message, "W 07.123456 vela_daemon::player spawn failed");
    }

    #[tokio::test]
    async fn malformed_action_is_ignored() {
        let bus = Arc::new(Bus::default());
        let log_controller = test_log_controller();
        handle_client_action("not json", &bus, &log_controller).await;
    }
}
