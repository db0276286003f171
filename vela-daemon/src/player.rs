//! Player lifecycle controller (spec §4.6).
//!
//! Grounded on the original `lowlevel/_player.py::OMXPlayer` (spawn/stop
//! state machine, alpha ramp loop, idempotent initial pause) and on
//! [`crate::process`]/[`crate::bus_name`]/[`crate::mpris`] for the
//! process, presence, and remote-call mechanics respectively.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, warn};
use zbus::Connection;

use crate::bus_name::BusNameTracker;
use crate::error::{Result, VelaError};
use crate::mpris::PlayerProxy;
use crate::process::Supervised;

const ALPHA_STEP_INTERVAL: Duration = Duration::from_millis(19);
const STOP_CALL_TIMEOUT: Duration = Duration::from_secs(1);
/// Twice the assumed frame period back-off before the computed end of video,
/// matching the original's auto-fadeout scheduling (spec §4.6).
const AUTO_FADEOUT_SLACK: Duration = Duration::from_millis(100);

/// How long to wait after `play()` before firing the auto-fadeout, clamped
/// to zero for media shorter than `fadeout + AUTO_FADEOUT_SLACK` so it fires
/// immediately instead of never (spec §4.6 B3).
fn auto_fadeout_delay(duration: Duration, fadeout: Duration) -> Duration {
    duration.saturating_sub(fadeout + AUTO_FADEOUT_SLACK)
}

/// Atomically claims the right to run a fade-out, returning `true` exactly
/// once per "armed" flag; a second concurrent call sees `false` and must
/// no-op (spec §4.6 `fadeout()`, R2).
fn claim_fadeout(flag: &std::sync::atomic::AtomicBool) -> bool {
    !flag.swap(true, Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Spawning,
    Ready,
    Stopping,
    Stopped,
}

pub struct PlayerParams {
    pub media: PathBuf,
    pub layer: u32,
    pub looping: bool,
    pub initial_alpha: i64,
    pub fadein: Duration,
    pub fadeout: Duration,
    pub player_bin: String,
}

/// Fires with the child's exit code once the process has exited, unless the
/// controller is explicitly stopping it.
pub type EndHook = Box<dyn FnOnce(Option<i32>) + Send + 'static>;

pub struct Player {
    bus_name: String,
    params: PlayerParams,
    connection: Connection,
    tracker: Arc<BusNameTracker>,
    state: RwLock<PlayerState>,
    ready_tx: Mutex<Option<Vec<oneshot::Sender<()>>>>,
    proxy: RwLock<Option<PlayerProxy<'static>>>,
    supervised: Mutex<Option<Supervised>>,
    fadeout_cancel: Mutex<Option<oneshot::Sender<()>>>,
    duration: RwLock<Duration>,
    stopping_intentionally: std::sync::atomic::AtomicBool,
    exit_code: RwLock<Option<i32>>,
    fading_out: std::sync::atomic::AtomicBool,
}

impl Player {
    pub async fn new(
        params: PlayerParams,
        connection: Connection,
        tracker: Arc<BusNameTracker>,
    ) -> Arc<Self> {
        let bus_name = tracker.generate_name("org.mpris.MediaPlayer2.vela").await;

        Arc::new(Self {
            bus_name,
            params,
            connection,
            tracker,
            state: RwLock::new(PlayerState::Idle),
            ready_tx: Mutex::new(Some(Vec::new())),
            proxy: RwLock::new(None),
            supervised: Mutex::new(None),
            fadeout_cancel: Mutex::new(None),
            duration: RwLock::new(Duration::ZERO),
            stopping_intentionally: std::sync::atomic::AtomicBool::new(false),
            exit_code: RwLock::new(None),
            fading_out: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub async fn state(&self) -> PlayerState {
        *self.state.read().await
    }

    pub fn layer(&self) -> u32 {
        self.params.layer
    }

    /// Spawns the child process, waits for bus-name presence, fetches the
    /// video duration, and settles into `Ready` paused (spec §4.6 `spawn`).
    pub async fn spawn(self: &Arc<Self>, end_hook: Option<EndHook>) -> Result<()> {
        *self.state.write().await = PlayerState::Spawning;

        let mut argv = vec![self.params.player_bin.clone()];
        if self.params.looping {
            argv.push("--loop".to_string());
        }
        argv.extend([
            "--dbus_name".to_string(),
            self.bus_name.clone(),
            "--layer".to_string(),
            self.params.layer.to_string(),
            "--orientation".to_string(),
            "180".to_string(),
            "--no-osd".to_string(),
            "--alpha".to_string(),
            self.params.initial_alpha.to_string(),
            self.params.media.to_string_lossy().to_string(),
        ]);

        let mut supervised = Supervised::spawn(&argv, &self.bus_name, None, None)?;
        let started = &mut supervised.started;
        started.await.map_err(|_| VelaError::ChildSpawnFailed {
            program: self.params.player_bin.clone(),
            source: std::io::Error::other("child exited before reporting its pid"),
        })?;

        let stopped_rx = std::mem::replace(&mut supervised.stopped, oneshot::channel().1);
        let me = self.clone();
        tokio::spawn(async move {
            let exit_code = stopped_rx.await.ok().and_then(|status| status.code());
            *me.exit_code.write().await = exit_code;
            *me.state.write().await = PlayerState::Stopped;
            if !me.stopping_intentionally.load(Ordering::SeqCst) {
                if let Some(hook) = end_hook {
                    hook(exit_code);
                }
            }
        });

        self.tracker.wait_for_start(&self.bus_name).await?;
        *self.supervised.lock().await = Some(supervised);

        let proxy = PlayerProxy::builder(&self.connection)
            .destination(self.bus_name.clone())
            .map_err(|e| VelaError::RemoteCallFailed {
                method: "Proxy::destination".into(),
                source: e,
            })?
            .build()
            .await
            .map_err(|e| VelaError::RemoteCallFailed {
                method: "PlayerProxy::build".into(),
                source: e,
            })?;

        let micros = timeout(STOP_CALL_TIMEOUT, proxy.duration())
            .await
            .map_err(|_| VelaError::RemoteCallTimeout {
                method: "Duration".into(),
                elapsed_ms: STOP_CALL_TIMEOUT.as_millis() as u64,
            })?
            .unwrap_or(0);
        *self.duration.write().await = Duration::from_micros(micros.max(0) as u64);

        *self.proxy.write().await = Some(proxy);

        *self.state.write().await = PlayerState::Ready;
        self.release_ready_waiters().await;

        // Idempotent initial pause: the child defaults to playing.
        self.call_play_pause_idempotent().await;

        Ok(())
    }

    async fn release_ready_waiters(&self) {
        if let Some(waiters) = self.ready_tx.lock().await.take() {
            for tx in waiters {
                let _ = tx.send(());
            }
        }
    }

    async fn await_ready(&self) {
        if *self.state.read().await == PlayerState::Ready {
            return;
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.ready_tx.lock().await;
            match guard.as_mut() {
                Some(waiters) => waiters.push(tx),
                None => return,
            }
        }
        let _ = rx.await;
    }

    async fn call_play_pause_idempotent(&self) {
        if let Some(proxy) = self.proxy.read().await.as_ref() {
            if let Err(e) = proxy.play_pause().await {
                warn!(bus_name = %self.bus_name, error = %e, "initial play_pause failed");
            }
        }
    }

    /// spec §4.6 `play(skip_fadein)`.
    pub async fn play(self: &Arc<Self>, skip_fadein: bool) {
        self.await_ready().await;
        self.fading_out.store(false, Ordering::SeqCst);

        if let Some(proxy) = self.proxy.read().await.as_ref() {
            if let Err(e) = proxy.play_pause().await {
                warn!(bus_name = %self.bus_name, error = %e, "play_pause failed");
            }
        }

        if !self.params.looping {
            let duration = *self.duration.read().await;
            let fadeout = self.params.fadeout;
            // Always scheduled, even for media shorter than fadeout + slack
            // (B3): the delay just clamps to zero, firing the auto-fadeout
            // immediately instead of never.
            let delay = auto_fadeout_delay(duration, fadeout);
            let me = self.clone();
            let (cancel_tx, mut cancel_rx) = oneshot::channel();
            *self.fadeout_cancel.lock().await = Some(cancel_tx);
            tokio::spawn(async move {
                tokio::select! {
                    _ = sleep(delay) => {
                        me.fadeout().await;
                    }
                    _ = &mut cancel_rx => {}
                }
            });
        }

        if skip_fadein {
            self.set_alpha_immediate(255).await;
        } else {
            self.ramp_alpha(self.params.initial_alpha, 255, self.params.fadein).await;
        }
    }

    /// spec §4.6 `fadeout()`. Two back-to-back calls perform only one ramp
    /// (R2): the second short-circuits while the first is still in flight.
    pub async fn fadeout(self: &Arc<Self>) {
        if !claim_fadeout(&self.fading_out) {
            return;
        }
        self.await_ready().await;
        if let Some(cancel) = self.fadeout_cancel.lock().await.take() {
            let _ = cancel.send(());
        }
        self.ramp_alpha(255, 0, self.params.fadeout).await;
    }

    /// spec §4.6 `fadeout_and_stop()`.
    pub async fn fadeout_and_stop(self: &Arc<Self>) {
        self.fadeout().await;
        self.stop(false, STOP_CALL_TIMEOUT).await;
    }

    /// spec §4.6 `stop(skip_bus, timeout)`.
    pub async fn stop(self: &Arc<Self>, skip_bus: bool, timeout_duration: Duration) -> Option<i32> {
        self.stopping_intentionally.store(true, Ordering::SeqCst);
        if let Some(cancel) = self.fadeout_cancel.lock().await.take() {
            let _ = cancel.send(());
        }

        if *self.state.read().await == PlayerState::Stopped {
            return *self.exit_code.read().await;
        }

        *self.state.write().await = PlayerState::Stopping;

        if !skip_bus {
            self.await_ready().await;
            let stopped_via_bus = if let Some(proxy) = self.proxy.read().await.as_ref() {
                match timeout(timeout_duration, proxy.stop()).await {
                    Ok(Ok(())) => true,
                    _ => false,
                }
            } else {
                false
            };

            if stopped_via_bus {
                let _ = timeout(timeout_duration, self.tracker.wait_for_stop(&self.bus_name)).await;
                *self.state.write().await = PlayerState::Stopped;
                return None;
            }
        }

        if let Some(supervised) = self.supervised.lock().await.as_ref() {
            let _ = supervised.terminate();
        }
        *self.state.write().await = PlayerState::Stopped;
        None
    }

    async fn set_alpha_immediate(&self, alpha: i64) {
        if let Some(proxy) = self.proxy.read().await.as_ref() {
            if let Err(e) = proxy.set_alpha(alpha).await {
                warn!(bus_name = %self.bus_name, error = %e, "set_alpha failed");
            }
        }
    }

    /// Repeatedly calls `SetAlpha` every ~19ms, interpolating linearly from
    /// `from` to `to` over `duration`, then issues one final exact
    /// `SetAlpha(to)` (spec §4.6 "Alpha ramping contract").
    async fn ramp_alpha(&self, from: i64, to: i64, duration: Duration) {
        if duration.is_zero() {
            self.set_alpha_immediate(to).await;
            return;
        }

        let start = Instant::now();
        let mut ticker = interval(ALPHA_STEP_INTERVAL);
        loop {
            ticker.tick().await;
            let elapsed = start.elapsed();
            if elapsed >= duration {
                break;
            }
            let t_rel = elapsed.as_secs_f64() / duration.as_secs_f64();
            let alpha = from + ((to - from) as f64 * t_rel) as i64;
            self.set_alpha_immediate(alpha).await;
        }
        self.set_alpha_immediate(to).await;
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn media_path(&self) -> &std::path::Path {
        &self.params.media
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_starts_idle() {
        // Smoke test for the enum; full lifecycle tests require a live bus
        // and player binary and live in the orchestrator integration tests.
        assert_eq!(PlayerState::Idle, PlayerState::Idle);
    }

    #[test]
    fn auto_fadeout_delay_clamps_to_zero_for_short_media() {
        let duration = Duration::from_millis(50);
        let fadeout = Duration::from_millis(200);
        assert_eq!(auto_fadeout_delay(duration, fadeout), Duration::ZERO);
    }

    #[test]
    fn auto_fadeout_delay_backs_off_before_the_computed_end() {
        let duration = Duration::from_secs(10);
        let fadeout = Duration::from_secs(2);
        assert_eq!(auto_fadeout_delay(duration, fadeout), Duration::from_millis(7900));
    }

    #[test]
    fn claim_fadeout_wins_the_race_exactly_once() {
        let flag = std::sync::atomic::AtomicBool::new(false);
        assert!(claim_fadeout(&flag), "first caller should win");
        assert!(!claim_fadeout(&flag), "second caller must back off");
    }
}
