//! Client library for the SBP settings sub-protocol.
//!
//! The settings daemon manages registration and read requests on the bus;
//! each process owns the values of its own settings and answers write
//! requests with a verdict. This crate provides the client side of that
//! exchange for three roles:
//!
//! * **owners** register settings and answer inbound writes, with an
//!   optional notify hook that can reject (and revert) an update;
//! * **watchers** track settings owned by other processes and stay in
//!   sync with their accepted writes;
//! * **controllers** read, write, and enumerate settings across the bus.
//!
//! The transport itself is not part of the crate: a context consumes a
//! [`Host`] implementation for sending, callback registration, and the
//! wait/signal primitive, and the host delivers inbound settings messages
//! to the callbacks the context registers.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use sbp_settings::{Settings, SettingType, SettingValue, Host};
//! # fn demo(host: Arc<dyn Host>) -> color_eyre::Result<()> {
//! let settings = Settings::new(0x2000, host);
//! let rate = SettingValue::of_i32(10);
//! settings.register("acquisition", "sbas_enabled", SettingType::INT, &rate, None)?;
//! # Ok(())
//! # }
//! ```
#![allow(clippy::upper_case_acronyms)]

pub mod client;
pub mod proto;
mod request;
pub mod setting;
pub mod types;

pub use client::{
    CallbackHandle, Host, MessageCallback, SettingRecord, Settings, REGISTER_TIMEOUT,
    REGISTER_TRIES, WATCH_INIT_TIMEOUT, WATCH_INIT_TRIES,
};
pub use proto::{MsgId, RegistrationStatus, WriteResult, DAEMON_SENDER_ID, PAYLOAD_MAX};
pub use setting::{NotifyFn, SettingValue};
pub use types::SettingType;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock that keeps going if a panicking notify hook poisoned the mutex.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
