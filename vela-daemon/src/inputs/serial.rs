//! Serial sensor adapter (spec §4.8, "serial sensor adapter emits
//! `arduino_reading(int)`").
//!
//! Grounded on the original `inputs/arduino/input.py` (reads newline
//! terminated integers off a serial port). The `serial` crate is
//! synchronous, so reads run on a blocking task, mirroring the teacher's
//! own use of `spawn_blocking` for its synchronous image-decode path.

use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;

use serial::SerialPort;
use tokio::sync::mpsc;
use tracing::warn;

use crate::bus::Bus;
use crate::error::{Result, VelaError};

pub async fn run(port: &str, baud: u32, bus: Arc<Bus>) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<i64>(64);
    let port = port.to_string();

    let blocking = tokio::task::spawn_blocking(move || read_loop(&port, baud, tx));

    while let Some(reading) = rx.recv().await {
        bus.arduino_reading.publish(reading).await;
    }

    match blocking.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(VelaError::DeviceOpenFailed {
            name: "serial".into(),
            reason: format!("reader task panicked: {e}"),
        }),
    }
}

fn read_loop(port_name: &str, baud: u32, tx: mpsc::Sender<i64>) -> Result<()> {
    let mut port = serial::open(port_name).map_err(|e| VelaError::DeviceOpenFailed {
        name: port_name.to_string(),
        reason: e.to_string(),
    })?;

    port.reconfigure(&|settings| {
        settings.set_baud_rate(serial::BaudRate::from_speed(baud as usize))?;
        settings.set_char_size(serial::Bits8);
        settings.set_parity(serial::ParityNone);
        settings.set_stop_bits(serial::Stop1);
        settings.set_flow_control(serial::FlowNone);
        Ok(())
    })
    .map_err(|e| VelaError::DeviceOpenFailed {
        name: port_name.to_string(),
        reason: e.to_string(),
    })?;
    port.set_timeout(Duration::from_secs(1))
        .map_err(|e| VelaError::DeviceOpenFailed {
            name: port_name.to_string(),
            reason: e.to_string(),
        })?;

    let mut reader = BufReader::new(port);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => match line.trim().parse::<i64>() {
                Ok(value) => {
                    if tx.blocking_send(value).is_err() {
                        break;
                    }
                }
                Err(_) => warn!(line = line.trim(), "serial input: unparseable line, ignoring"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!(error = %e, "serial input: read error, giving up");
                break;
            }
        }
    }
    Ok(())
}
