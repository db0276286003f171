//! MPRIS `org.mpris.MediaPlayer2.Player` remote-call surface.
//!
//! Grounded on `justinsandhu-wayle`'s `MediaPlayer2PlayerProxy` (zbus
//! `#[proxy]` macro, `.destination(...)` builder pattern) and the original
//! `lowlevel/_player.py::OMXPlayer.action`/`set_alpha`, which drive the same
//! remote surface over the `org.mpris.MediaPlayer2.Player` and
//! `org.freedesktop.DBus.Properties` interfaces.

use zbus::proxy;

#[proxy(
    interface = "org.mpris.MediaPlayer2.Player",
    default_path = "/org/mpris/MediaPlayer2"
)]
pub trait Player {
    async fn play(&self) -> zbus::Result<()>;
    async fn pause(&self) -> zbus::Result<()>;
    async fn play_pause(&self) -> zbus::Result<()>;
    async fn stop(&self) -> zbus::Result<()>;

    /// Extension the real players (omxplayer, vlc-mpris-bridge) expose
    /// outside the strict MPRIS surface: sets overlay transparency 0..255.
    #[zbus(name = "SetAlpha")]
    async fn set_alpha(&self, alpha: i64) -> zbus::Result<i64>;

    #[zbus(property)]
    fn playback_status(&self) -> zbus::Result<String>;

    /// Microseconds, per spec §6 ("property read ... property Duration").
    #[zbus(property)]
    fn duration(&self) -> zbus::Result<i64>;
}
