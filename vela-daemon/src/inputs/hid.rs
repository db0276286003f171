//! HID adapter (spec §4.8, "HID adapter emits `hid(value)` at a fixed
//! cadence... sampling the most-recent raw event value transformed by
//! `scale*v + offset`").
//!
//! Grounded on the original `inputs/hid/input.py` (opens `/dev/input/eventN`,
//! grabs it exclusively via `EVIOCGRAB`, samples the latest axis value on a
//! timer) and on raw `libc::ioctl` use for device grabbing, the idiom the
//! pack reaches for when there's no safe wrapper crate for a given syscall.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::warn;

use crate::bus::Bus;
use crate::error::{Result, VelaError};

const EVIOCGRAB: libc::c_ulong = 0x40044590;

/// Mirrors `struct input_event` from `linux/input.h` on 64-bit platforms.
#[repr(C)]
#[allow(dead_code)]
struct InputEvent {
    tv_sec: i64,
    tv_usec: i64,
    kind: u16,
    code: u16,
    value: i32,
}

const EV_SIZE: usize = std::mem::size_of::<InputEvent>();

pub async fn run(device: &str, scale: f64, offset: f64, interval_ms: u64, bus: Arc<Bus>) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .open(device)
        .map_err(|e| VelaError::DeviceOpenFailed {
            name: device.to_string(),
            reason: e.to_string(),
        })?;
    grab(&file)?;

    let (latest_tx, mut latest_rx) = watch::channel::<i32>(0);
    let reader_file = file.try_clone().map_err(|e| VelaError::DeviceOpenFailed {
        name: device.to_string(),
        reason: e.to_string(),
    })?;
    let device_name = device.to_string();
    tokio::task::spawn_blocking(move || read_events(reader_file, latest_tx, &device_name));

    let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
    loop {
        ticker.tick().await;
        let raw = *latest_rx.borrow_and_update();
        let sample = scale * raw as f64 + offset;
        bus.hid.publish(sample).await;
    }
}

fn grab(file: &File) -> Result<()> {
    let result = unsafe { libc::ioctl(file.as_raw_fd(), EVIOCGRAB, 1) };
    if result < 0 {
        return Err(VelaError::DeviceOpenFailed {
            name: "hid".into(),
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

fn read_events(mut file: File, latest: watch::Sender<i32>, device_name: &str) {
    let mut buf = [0u8; EV_SIZE];
    loop {
        match file.read_exact(&mut buf) {
            Ok(()) => {
                let event = decode(&buf);
                // type 3 == EV_ABS, the axis-report event kind the original
                // samples for analogue sensors wired through a HID bridge.
                if event.kind == 3 {
                    let _ = latest.send(event.value);
                }
            }
            Err(e) => {
                warn!(device = device_name, error = %e, "hid input: read error, giving up");
                break;
            }
        }
    }
}

fn decode(buf: &[u8; EV_SIZE]) -> InputEvent {
    InputEvent {
        tv_sec: i64::from_ne_bytes(buf[0..8].try_into().unwrap()),
        tv_usec: i64::from_ne_bytes(buf[8..16].try_into().unwrap()),
        kind: u16::from_ne_bytes(buf[16..18].try_into().unwrap()),
        code: u16::from_ne_bytes(buf[18..20].try_into().unwrap()),
        value: i32::from_ne_bytes(buf[20..24].try_into().unwrap()),
    }
}
