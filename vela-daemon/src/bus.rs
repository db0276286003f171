//! The concrete set of named channels the core and its collaborators share.
//!
//! Design note §9 asks for "typed channels per event with a thin
//! name-indexed wrapper" rather than a stringly-typed `dyn Any` registry;
//! `Bus` is that wrapper, built out of [`crate::event_bus::Channel`].

use crate::event_bus::Channel;

/// A raw sensor reading in source units, before AGD processing.
pub type RawReading = f64;

/// One level-change request, published whenever a source wants the
/// orchestrator to consider switching its active level (spec §4.5 step 5,
/// §4.8 network/web adapters).
#[derive(Debug, Clone, PartialEq)]
pub struct LevelChangeRequest {
    pub level: u32,
    pub source: &'static str,
}

/// An observability record pairing a raw reading with its AGD sum
/// (spec §4.5 step 6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgdSample {
    pub raw: RawReading,
    pub agd: i64,
}

/// Published whenever an AGD threshold is changed via `set_threshold`
/// (spec §4.5 "Configuration").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdChanged {
    pub level: usize,
    pub value: i64,
}

/// A request to change AGD threshold `level` (1-indexed) to `value`,
/// published by input adapters and consumed by the AGD detector, which
/// mutates its state and re-publishes [`ThresholdChanged`] (spec §6
/// `set_agd_threshold`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetThresholdRequest {
    pub level: usize,
    pub value: i64,
}

/// A single fanned-out log record, mirroring the original's
/// `log/bridge.py` adapter shape (`"L SS.mmmmmm NS TEXT"`, spec §6).
///
/// `seconds`/`micros` are the wall-clock second-of-minute and the
/// microsecond remainder at publish time, matching
/// `log_datetime.strftime('%S.%f')[:6]` in the original.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level_letter: char,
    pub seconds: u32,
    pub micros: u32,
    pub namespace: String,
    pub text: String,
}

pub struct Bus {
    pub arduino_reading: Channel<i64>,
    pub hid: Channel<RawReading>,
    pub change_play_level: Channel<LevelChangeRequest>,
    pub agd_output: Channel<AgdSample>,
    pub set_threshold_request: Channel<SetThresholdRequest>,
    pub threshold_changed: Channel<ThresholdChanged>,
    /// Uses the recursion-safe constructor: a failing log handler must not
    /// itself publish a log message (spec §4.1).
    pub log_message: Channel<LogRecord>,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            arduino_reading: Channel::new("arduino_reading"),
            hid: Channel::new("hid"),
            change_play_level: Channel::new("change_play_level"),
            agd_output: Channel::new("agd_output"),
            set_threshold_request: Channel::new("set_threshold_request"),
            threshold_changed: Channel::new("threshold_changed"),
            log_message: Channel::without_log_recursion("log_message"),
        }
    }
}
