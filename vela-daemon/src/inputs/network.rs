//! Network line input adapter (spec §4.8, §6 "Network line input").
//!
//! Grounded on the original `inputs/network/input.py` (a `LineReceiver`
//! protocol over a listening TCP socket) and on `tokio::net::TcpListener`
//! line-reading idioms used throughout the pack.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::bus::{Bus, LevelChangeRequest};
use crate::error::{Result, VelaError};

/// Accepts any number of concurrent TCP clients; each CRLF-delimited line
/// that parses as a non-negative integer publishes `change_play_level`.
/// Unparseable lines are logged and ignored (spec §6).
pub async fn run(bind: &str, bus: Arc<Bus>) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| VelaError::DeviceOpenFailed {
            name: "network".into(),
            reason: e.to_string(),
        })?;
    info!(bind, "network line input listening");

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "network input accept failed");
                continue;
            }
        };
        let bus = bus.clone();
        tokio::spawn(async move {
            handle_client(socket, bus).await;
            info!(%peer, "network input client disconnected");
        });
    }
}

async fn handle_client(socket: tokio::net::TcpStream, bus: Arc<Bus>) {
    let mut lines = BufReader::new(socket).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(raw)) => {
                let line = raw.trim_end_matches(['\r', '\n']);
                match line.trim().parse::<u32>() {
                    Ok(level) => {
                        bus.change_play_level
                            .publish(LevelChangeRequest {
                                level,
                                source: "network",
                            })
                            .await;
                    }
                    Err(_) => warn!(line, "network input: unparseable line, ignoring"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "network input read error");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn valid_line_publishes_change_play_level() {
        let bus = Arc::new(Bus::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let bus2 = bus.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            handle_client(socket, bus2).await;
        });

        let received = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let received2 = received.clone();
        bus.change_play_level
            .attach(move |req| {
                let received2 = received2.clone();
                async move {
                    received2.lock().await.push(req);
                    Ok(())
                }
            })
            .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"2\r\nbogus\r\n3\r\n").await.unwrap();
        drop(stream);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let got = received.lock().await;
        assert_eq!(
            *got,
            vec![
                LevelChangeRequest { level: 2, source: "network" },
                LevelChangeRequest { level: 3, source: "network" },
            ]
        );
    }
}
