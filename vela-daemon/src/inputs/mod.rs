//! Input adapters (spec §4.8): independent tasks that publish onto the
//! shared [`crate::bus::Bus`].

pub mod hid;
pub mod network;
pub mod serial;
pub mod web;
