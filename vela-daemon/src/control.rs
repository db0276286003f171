//! Unix-socket control protocol (spec §6, operator/`velactl` surface).
//!
//! Grounded on the teacher's `main.rs` IPC loop: a `UnixListener` accepting
//! one JSON request per connection and writing back one JSON response,
//! reusing `vela_common::{Request, Response}` for the wire shapes instead of
//! the teacher's own `kaleidux_common::{Request, Response}`.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};
use vela_common::{DaemonStatus, LevelStatus, Request, Response};

use crate::agd::AgdDetector;
use crate::bus::{Bus, LevelChangeRequest, SetThresholdRequest};
use crate::error::{Result, VelaError};
use crate::logging::LogController;
use crate::orchestrator::Orchestrator;

pub struct ControlServer {
    orchestrator: Arc<Orchestrator>,
    agd: Arc<AgdDetector>,
    bus: Arc<Bus>,
    log_controller: Arc<LogController>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ControlServer {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        agd: Arc<AgdDetector>,
        bus: Arc<Bus>,
        log_controller: Arc<LogController>,
        shutdown_tx: oneshot::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            agd,
            bus,
            log_controller,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        })
    }

    pub async fn run(self: Arc<Self>, socket_path: &Path) -> Result<()> {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path).map_err(|e| VelaError::DeviceOpenFailed {
            name: "control-socket".into(),
            reason: e.to_string(),
        })?;
        info!(path = %socket_path.display(), "control socket listening");

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "control socket accept failed");
                    continue;
                }
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    warn!(error = %e, "control connection failed");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .await
            .map_err(|e| VelaError::DeviceOpenFailed {
                name: "control-socket".into(),
                reason: e.to_string(),
            })?;

        let response = match serde_json::from_slice::<Request>(&buf) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => Response::Error {
                message: format!("malformed request: {e}"),
            },
        };

        let encoded = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
        stream
            .write_all(&encoded)
            .await
            .map_err(|e| VelaError::DeviceOpenFailed {
                name: "control-socket".into(),
                reason: e.to_string(),
            })
    }

    async fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::Status => Response::Status(self.status().await),
            Request::ChangeLevel { level } => {
                self.bus
                    .change_play_level
                    .publish(LevelChangeRequest { level, source: "control" })
                    .await;
                Response::Ok
            }
            Request::SetThreshold { level, value } => {
                self.bus
                    .set_threshold_request
                    .publish(SetThresholdRequest {
                        level: level as usize,
                        value,
                    })
                    .await;
                Response::Ok
            }
            Request::SetLogLevel { namespace, level } => {
                match self.log_controller.set_level(&namespace, &level).await {
                    Ok(()) => {
                        info!(namespace, level, "control: log level updated");
                        Response::Ok
                    }
                    Err(e) => Response::Error { message: e.to_string() },
                }
            }
            Request::Shutdown => {
                if let Some(tx) = self.shutdown_tx.lock().await.take() {
                    let _ = tx.send(());
                }
                Response::Ok
            }
        }
    }

    async fn status(&self) -> DaemonStatus {
        let levels = self.orchestrator.status_snapshot().await;
        DaemonStatus {
            levels: levels
                .into_iter()
                .map(|(level, bus_name, media, state)| LevelStatus {
                    level,
                    bus_name,
                    media,
                    state,
                })
                .collect(),
            current_level: self.orchestrator.current_level().await,
            agd_sum: self.agd.sum().await,
            agd_last_level: self.agd.last_level().await,
        }
    }
}
