//! SBP settings client: the context, the host interface, and the
//! synchronous request/reply engine.
//!
//! The settings daemon routes registrations and read requests on the bus,
//! while each owning process answers write requests for its own settings.
//! A context holds the list of settings this process owns or watches and
//! keeps them in sync with the daemon through the message handlers below.
//!
//! Blocking operations link a request descriptor into the context, send
//! the message, and wait for the matching reply with a retry budget; the
//! transport delivers inbound messages through callbacks registered with
//! the host, which complete the descriptor and wake the waiter.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitflags::bitflags;
use color_eyre::eyre::{bail, ensure};
use color_eyre::Result;
use log::{error, warn};

use crate::lock;
use crate::proto::{
    format_tokens, index_payload, parse_tokens, MsgId, ProtocolError, RegistrationStatus,
    TokenCount, WriteResult, DAEMON_SENDER_ID, PAYLOAD_MAX,
};
use crate::request::{self, RequestEvent, RequestState};
use crate::setting::{insert_setting, NotifyFn, SettingData, SettingValue};
use crate::types::{SettingType, TypeRegistry};

/// Timeout between retries of a register or write transaction.
pub const REGISTER_TIMEOUT: Duration = Duration::from_millis(500);
/// Send attempts for a register or write transaction.
pub const REGISTER_TRIES: u32 = 5;
/// Timeout between retries of a read or watch-priming transaction.
pub const WATCH_INIT_TIMEOUT: Duration = Duration::from_millis(500);
/// Send attempts for a read or watch-priming transaction.
pub const WATCH_INIT_TRIES: u32 = 5;

/// Callback handed to the host for one subscribed message id. Invoked
/// with the message's sender id and payload.
pub type MessageCallback = Box<dyn Fn(u16, &[u8]) + Send + Sync>;

/// Opaque token minted by the host for a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackHandle(pub u64);

/// The interface a context consumes from its host process: an SBP
/// transport plus the context-scoped wait/signal primitive.
///
/// `wait`/`signal` carry the callback→waiter handoff in shared-wait mode
/// ([`Settings::new`]); a cooperative single-threaded host is expected to
/// pump its receive loop inside `wait`. In threaded mode
/// ([`Settings::new_threaded`]) each request waits on its own internal
/// event instead and `signal` is never called.
pub trait Host: Send + Sync {
    /// Send a message with the host's own sender id.
    fn send(&self, msg_id: u16, payload: &[u8]) -> io::Result<()>;

    /// Send a message with an explicit sender id.
    fn send_from(&self, msg_id: u16, payload: &[u8], sender_id: u16) -> io::Result<()>;

    /// Subscribe `callback` to inbound messages of `msg_id`. The context
    /// registers each id at most once.
    fn register_cb(&self, msg_id: u16, callback: MessageCallback) -> io::Result<CallbackHandle>;

    /// Drop a subscription made with [`Host::register_cb`].
    fn unregister_cb(&self, handle: CallbackHandle) -> io::Result<()>;

    /// Block until [`Host::signal`] or the timeout. Returns true when
    /// signalled.
    fn wait(&self, timeout: Duration) -> bool;

    /// Wake the waiter blocked in [`Host::wait`].
    fn signal(&self);

    /// Called once per operation before the first send, e.g. to drain a
    /// stale semaphore.
    fn wait_init(&self) {}

    /// Called once per operation after the wait loop ends.
    fn wait_deinit(&self) {}
}

bitflags! {
    /// Entries an inbound value update must leave alone.
    struct UpdateFilter: u8 {
        const SKIP_READONLY = 1 << 0;
        const SKIP_WATCHONLY = 1 << 1;
        /// Entries that are neither readonly nor watchonly.
        const SKIP_OWNED = 1 << 2;
    }
}

/// One enumerated setting, as returned by [`Settings::read_by_index`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingRecord {
    /// Setting section.
    pub section: String,
    /// Setting name.
    pub name: String,
    /// Current value in text form.
    pub value: String,
    /// Type descriptor string, possibly empty.
    pub fmt_type: String,
}

struct Inner {
    types: TypeRegistry,
    settings: Vec<SettingData>,
    requests: Vec<RequestState>,
    subs: Vec<(MsgId, CallbackHandle)>,
    next_token: u64,
}

struct SettingsCore {
    host: Arc<dyn Host>,
    sender_id: u16,
    threaded: bool,
    inner: Mutex<Inner>,
}

/// A settings client context.
///
/// Owns the type registry, the settings list and the in-flight request
/// tracker. Contexts are independent; a process talking to several buses
/// uses one context per bus (with distinct sender ids).
#[derive(Clone)]
pub struct Settings {
    core: Arc<SettingsCore>,
}

impl Settings {
    /// Context in shared-wait mode: blocking operations park in
    /// [`Host::wait`] and inbound callbacks wake them via
    /// [`Host::signal`]. Operations must not overlap.
    pub fn new(sender_id: u16, host: Arc<dyn Host>) -> Settings {
        Self::with_mode(sender_id, host, false)
    }

    /// Context in threaded mode: every request gets its own one-shot
    /// event, so blocking operations may run concurrently from multiple
    /// threads.
    pub fn new_threaded(sender_id: u16, host: Arc<dyn Host>) -> Settings {
        Self::with_mode(sender_id, host, true)
    }

    fn with_mode(sender_id: u16, host: Arc<dyn Host>, threaded: bool) -> Settings {
        Settings {
            core: Arc::new(SettingsCore {
                host,
                sender_id,
                threaded,
                inner: Mutex::new(Inner {
                    types: TypeRegistry::new(),
                    settings: Vec::new(),
                    requests: Vec::new(),
                    subs: Vec::new(),
                    next_token: 0,
                }),
            }),
        }
    }

    /// Register a new settings type over the given enum name table,
    /// returning the id to register settings with.
    pub fn register_enum(&self, names: &[&str]) -> SettingType {
        lock(&self.core.inner).types.register_enum(names)
    }

    /// Register an owned setting with the daemon and answer write
    /// requests for it from now on.
    ///
    /// The daemon's reply carries the authoritative initial value: the
    /// registered value wins unless the daemon has a persisted one, in
    /// which case the storage is updated and `notify` fires once.
    pub fn register(
        &self,
        section: &str,
        name: &str,
        ty: SettingType,
        value: &SettingValue,
        notify: Option<NotifyFn>,
    ) -> Result<()> {
        self.add_setting(section, name, ty, value, notify, false, false)
    }

    /// Register an owned setting that rejects all inbound writes with
    /// [`WriteResult::READ_ONLY`].
    pub fn register_readonly(
        &self,
        section: &str,
        name: &str,
        ty: SettingType,
        value: &SettingValue,
    ) -> Result<()> {
        self.add_setting(section, name, ty, value, None, true, false)
    }

    /// Track a setting owned by another process: the storage follows its
    /// accepted writes and `notify` fires on every update.
    pub fn watch(
        &self,
        section: &str,
        name: &str,
        ty: SettingType,
        value: &SettingValue,
        notify: Option<NotifyFn>,
    ) -> Result<()> {
        self.add_setting(section, name, ty, value, notify, false, true)
    }

    /// Write a setting owned by some process on the bus. The returned
    /// status is the owner's verdict, or [`WriteResult::TIMEOUT`] when no
    /// reply arrived within the retry budget.
    pub fn write(
        &self,
        section: &str,
        name: &str,
        ty: SettingType,
        value: &SettingValue,
    ) -> Result<WriteResult> {
        self.subscribe(MsgId::WRITE_RESP)?;

        let (payload, header_len) = {
            let inner = lock(&self.core.inner);
            let codec = inner
                .types
                .lookup(ty)
                .ok_or_else(|| ProtocolError::new("invalid type"))?;
            let text = value
                .with_blob(|blob| codec.to_text(blob))
                .ok_or_else(|| ProtocolError::new("settings write value serialization failed"))?;
            let payload = format_tokens(Some(section), Some(name), Some(&text), None)
                .ok_or_else(|| ProtocolError::new("settings write message format failed"))?;
            (payload, section.len() + name.len() + 2)
        };

        let req = self.core.perform_request(
            MsgId::WRITE,
            &payload,
            header_len,
            REGISTER_TIMEOUT,
            REGISTER_TRIES,
            DAEMON_SENDER_ID,
        );
        Ok(match req {
            Some(req) => req.status,
            None => WriteResult::TIMEOUT,
        })
    }

    /// Write an integer setting.
    pub fn write_int(&self, section: &str, name: &str, value: i32) -> Result<WriteResult> {
        self.write(section, name, SettingType::INT, &SettingValue::of_i32(value))
    }

    /// Write a float setting.
    pub fn write_float(&self, section: &str, name: &str, value: f32) -> Result<WriteResult> {
        self.write(section, name, SettingType::FLOAT, &SettingValue::of_f32(value))
    }

    /// Write a string setting.
    pub fn write_str(&self, section: &str, name: &str, value: &str) -> Result<WriteResult> {
        let cell = SettingValue::of_str(value.len() + 1, value)?;
        self.write(section, name, SettingType::STRING, &cell)
    }

    /// Write a boolean setting.
    pub fn write_bool(&self, section: &str, name: &str, value: bool) -> Result<WriteResult> {
        self.write(section, name, SettingType::BOOL, &SettingValue::of_bool(value))
    }

    /// Read a setting from the bus into `dest`. The reply's type
    /// descriptor must agree with `ty` (enum descriptors are taken on
    /// faith, since the daemon cannot name our local enum ids).
    pub fn read(
        &self,
        section: &str,
        name: &str,
        ty: SettingType,
        dest: &SettingValue,
    ) -> Result<()> {
        let payload = format_tokens(Some(section), Some(name), None, None)
            .ok_or_else(|| ProtocolError::new("error building settings read req message"))?;

        self.subscribe(MsgId::READ_RESP)?;
        let req = self.core.perform_request(
            MsgId::READ_REQ,
            &payload,
            payload.len(),
            WATCH_INIT_TIMEOUT,
            WATCH_INIT_TRIES,
            DAEMON_SENDER_ID,
        );
        self.unsubscribe(MsgId::READ_RESP);

        let req = req
            .ok_or_else(|| ProtocolError::new(format!("reading {section}.{name} timed out")))?;

        let resolved = match req.resp_type.as_deref() {
            None | Some("") => ty,
            Some(t) if t.starts_with("enum:") => ty,
            Some(t) => {
                let id: usize = t
                    .parse()
                    .map_err(|_| ProtocolError::new(format!("unparseable setting type {t:?}")))?;
                SettingType(id)
            }
        };
        ensure!(resolved == ty, ProtocolError::new("setting types don't match"));

        let text = req
            .resp_value
            .as_deref()
            .ok_or_else(|| ProtocolError::new(format!("{section}.{name} has no value")))?;

        let inner = lock(&self.core.inner);
        let codec = inner
            .types
            .lookup(ty)
            .ok_or_else(|| ProtocolError::new("unknown setting type"))?;
        ensure!(
            dest.with_blob(|blob| codec.from_text(blob, text)),
            ProtocolError::new("value parsing failed")
        );
        Ok(())
    }

    /// Read an integer setting.
    pub fn read_int(&self, section: &str, name: &str) -> Result<i32> {
        let dest = SettingValue::of_i32(0);
        self.read(section, name, SettingType::INT, &dest)?;
        dest.as_i32()
            .ok_or_else(|| ProtocolError::new("integer storage corrupted").into())
    }

    /// Read a float setting.
    pub fn read_float(&self, section: &str, name: &str) -> Result<f32> {
        let dest = SettingValue::of_f32(0.0);
        self.read(section, name, SettingType::FLOAT, &dest)?;
        dest.as_f32()
            .ok_or_else(|| ProtocolError::new("float storage corrupted").into())
    }

    /// Read a string setting of at most `capacity - 1` bytes.
    pub fn read_str(&self, section: &str, name: &str, capacity: usize) -> Result<String> {
        let dest = SettingValue::of_str(capacity, "")?;
        self.read(section, name, SettingType::STRING, &dest)?;
        dest.as_str()
            .ok_or_else(|| ProtocolError::new("string storage corrupted").into())
    }

    /// Read a boolean setting.
    pub fn read_bool(&self, section: &str, name: &str) -> Result<bool> {
        let dest = SettingValue::of_bool(false);
        self.read(section, name, SettingType::BOOL, &dest)?;
        dest.as_bool()
            .ok_or_else(|| ProtocolError::new("bool storage corrupted").into())
    }

    /// Fetch the setting at enumeration index `idx`. `Ok(None)` marks the
    /// end of the enumeration.
    pub fn read_by_index(&self, idx: u16) -> Result<Option<SettingRecord>> {
        self.subscribe(MsgId::READ_BY_INDEX_RESP)?;
        if let Err(err) = self.subscribe(MsgId::READ_BY_INDEX_DONE) {
            self.unsubscribe(MsgId::READ_BY_INDEX_RESP);
            return Err(err);
        }

        let payload = index_payload(idx);
        let req = self.core.perform_request(
            MsgId::READ_BY_INDEX_REQ,
            &payload,
            payload.len(),
            WATCH_INIT_TIMEOUT,
            WATCH_INIT_TRIES,
            DAEMON_SENDER_ID,
        );

        self.unsubscribe(MsgId::READ_BY_INDEX_RESP);
        self.unsubscribe(MsgId::READ_BY_INDEX_DONE);

        let req = req.ok_or_else(|| {
            error!("read by idx request failed");
            ProtocolError::new(format!("read by index {idx} timed out"))
        })?;

        if req.done {
            return Ok(None);
        }
        Ok(Some(SettingRecord {
            section: req.resp_section.unwrap_or_default(),
            name: req.resp_name.unwrap_or_default(),
            value: req.resp_value.unwrap_or_default(),
            fmt_type: req.resp_type.unwrap_or_default(),
        }))
    }

    fn add_setting(
        &self,
        section: &str,
        name: &str,
        ty: SettingType,
        value: &SettingValue,
        notify: Option<NotifyFn>,
        readonly: bool,
        watchonly: bool,
    ) -> Result<()> {
        {
            let mut inner = lock(&self.core.inner);
            if inner
                .settings
                .iter()
                .any(|s| s.section == section && s.name == name)
            {
                error!("setting add failed - duplicate setting {section}.{name}");
                bail!(ProtocolError::new(format!(
                    "duplicate setting {section}.{name}"
                )));
            }
            ensure!(
                inner.types.lookup(ty).is_some(),
                ProtocolError::new("invalid type")
            );
            let entry = SettingData::new(section, name, value.clone(), ty, notify, readonly, watchonly);
            insert_setting(&mut inner.settings, entry);
        }

        let result = if watchonly {
            self.init_watch(section, name)
        } else {
            self.register_owned(section, name)
        };

        if let Err(err) = result {
            // unwind the half-initialized entry
            let mut inner = lock(&self.core.inner);
            inner
                .settings
                .retain(|s| !(s.section == section && s.name == name));
            return Err(err);
        }
        Ok(())
    }

    fn register_owned(&self, section: &str, name: &str) -> Result<()> {
        self.subscribe(MsgId::REGISTER_RESP)?;
        self.subscribe(MsgId::WRITE)?;

        let (payload, header_len) = {
            let inner = lock(&self.core.inner);
            let entry = inner
                .settings
                .iter()
                .find(|s| s.section == section && s.name == name)
                .ok_or_else(|| ProtocolError::new("setting vanished before registration"))?;
            entry
                .format(&inner.types, true)
                .ok_or_else(|| ProtocolError::new("setting register message format failed"))?
        };

        let req = self.core.perform_request(
            MsgId::REGISTER,
            &payload,
            header_len,
            REGISTER_TIMEOUT,
            REGISTER_TRIES,
            self.core.sender_id,
        );
        if req.is_none() {
            error!("error registering {section}.{name} with settings manager");
            bail!(ProtocolError::new(format!(
                "registering {section}.{name} timed out"
            )));
        }
        Ok(())
    }

    fn init_watch(&self, section: &str, name: &str) -> Result<()> {
        self.subscribe(MsgId::WRITE_RESP)?;
        self.subscribe(MsgId::READ_RESP)?;

        let payload = format_tokens(Some(section), Some(name), None, None)
            .ok_or_else(|| ProtocolError::new("error building settings read req message"))?;

        let req = self.core.perform_request(
            MsgId::READ_REQ,
            &payload,
            payload.len(),
            WATCH_INIT_TIMEOUT,
            WATCH_INIT_TRIES,
            DAEMON_SENDER_ID,
        );
        self.unsubscribe(MsgId::READ_RESP);

        match req {
            Some(req) if req.resp_value.is_none() => {
                warn!("watched setting {section}.{name} is not registered yet, value uninitialized");
            }
            Some(_) => {}
            None => {
                warn!("unable to read watched setting {section}.{name} to initial value");
            }
        }
        Ok(())
    }

    /// Subscribe the context's handler for `msg_id` with the host.
    /// Returns false when the id was already subscribed; the host sees at
    /// most one registration per id.
    fn subscribe(&self, msg_id: MsgId) -> Result<bool> {
        let mut inner = lock(&self.core.inner);
        if inner.subs.iter().any(|(id, _)| *id == msg_id) {
            return Ok(false);
        }

        let weak = Arc::downgrade(&self.core);
        let callback: MessageCallback = Box::new(move |sender_id, payload| {
            if let Some(core) = weak.upgrade() {
                core.dispatch(msg_id, sender_id, payload);
            }
        });

        match self.core.host.register_cb(msg_id.into(), callback) {
            Ok(handle) => {
                inner.subs.push((msg_id, handle));
                Ok(true)
            }
            Err(err) => {
                error!("error registering callback for msg id {}", u16::from(msg_id));
                Err(err.into())
            }
        }
    }

    fn unsubscribe(&self, msg_id: MsgId) {
        let mut inner = lock(&self.core.inner);
        if let Some(pos) = inner.subs.iter().position(|(id, _)| *id == msg_id) {
            let (_, handle) = inner.subs.remove(pos);
            if self.core.host.unregister_cb(handle).is_err() {
                error!(
                    "error unregistering callback for msg id {}",
                    u16::from(msg_id)
                );
            }
        }
    }
}

impl SettingsCore {
    /// Send `payload` and block until a reply matching its first
    /// `header_len` bytes arrives, retrying on timeout. Returns the
    /// completed request descriptor, or `None` when the budget ran out.
    fn perform_request(
        &self,
        msg_id: MsgId,
        payload: &[u8],
        header_len: usize,
        timeout: Duration,
        retries: u32,
        sender_id: u16,
    ) -> Option<RequestState> {
        let event = self.threaded.then(|| Arc::new(RequestEvent::new()));
        let token = {
            let mut inner = lock(&self.inner);
            let token = inner.next_token;
            inner.next_token += 1;
            let state = RequestState::new(token, msg_id, &payload[..header_len], event.clone());
            inner.requests.push(state);
            token
        };

        self.host.wait_init();

        let mut success = false;
        let mut tries = 0;
        loop {
            if let Err(err) = self.host.send_from(msg_id.into(), payload, sender_id) {
                // the next retry will resend
                warn!("sending settings message failed: {err}");
            }

            let signalled = match &event {
                Some(event) => event.wait(timeout),
                None => self.host.wait(timeout),
            };
            if signalled {
                let inner = lock(&self.inner);
                success = inner.requests.iter().any(|r| r.token == token && r.matched);
            } else {
                warn!("waiting reply for msg id {} timed out", u16::from(msg_id));
            }

            tries += 1;
            if success || tries >= retries {
                break;
            }
        }

        self.host.wait_deinit();

        let mut inner = lock(&self.inner);
        let pos = match inner.requests.iter().position(|r| r.token == token) {
            Some(pos) => pos,
            None => {
                error!("request descriptor vanished from the tracker");
                return None;
            }
        };
        let req = inner.requests.remove(pos);

        if !success {
            warn!(
                "setting req/reply failed after {tries} tries (msg id: {})",
                u16::from(msg_id)
            );
            return None;
        }
        Some(req)
    }

    fn dispatch(&self, msg_id: MsgId, sender_id: u16, payload: &[u8]) {
        match msg_id {
            MsgId::REGISTER_RESP => self.handle_register_resp(sender_id, payload),
            MsgId::WRITE => self.handle_write(sender_id, payload),
            MsgId::WRITE_RESP => self.handle_write_resp(payload),
            MsgId::READ_RESP => self.handle_read_resp(payload),
            MsgId::READ_BY_INDEX_RESP => self.handle_read_by_index_resp(payload),
            MsgId::READ_BY_INDEX_DONE => self.handle_read_by_index_done(),
            _ => warn!("unexpected message id {:?}", msg_id),
        }
    }

    fn handle_register_resp(&self, sender_id: u16, payload: &[u8]) {
        if sender_id != DAEMON_SENDER_ID {
            warn!("invalid sender {sender_id:#x} != {DAEMON_SENDER_ID:#x}");
            return;
        }
        let (status, setting) = match payload.split_first() {
            Some((&status, rest)) => (status, rest),
            None => {
                warn!("empty register resp");
                return;
            }
        };
        let status = match RegistrationStatus::try_from(status) {
            Ok(status) => status,
            Err(_) => {
                warn!("register resp with unknown status {status}");
                return;
            }
        };
        if status == RegistrationStatus::PARSE_FAILED {
            // request corrupted in transit: stay silent and let the
            // timeout drive a resend
            return;
        }

        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        let req = match request::lookup_mut(&mut inner.requests, setting, MsgId::REGISTER) {
            Some(req) => req,
            None => {
                warn!("register resp with no pending registration request");
                return;
            }
        };

        // apply the daemon's authoritative value; a caller-supplied
        // readonly value is never overwritten
        update_value_filtered(
            &inner.types,
            &mut inner.settings,
            setting,
            UpdateFilter::SKIP_READONLY,
        );

        if req.complete(MsgId::REGISTER) {
            self.wake(req);
        }
    }

    fn handle_write(&self, sender_id: u16, payload: &[u8]) {
        if sender_id != DAEMON_SENDER_ID {
            warn!("invalid sender {sender_id:#x} != {DAEMON_SENDER_ID:#x}");
            return;
        }

        let mut guard = lock(&self.inner);
        let inner = &mut *guard;

        let (count, tokens) = parse_tokens(payload);
        if count < TokenCount::Value {
            warn!("settings write, error parsing setting");
            return;
        }

        if payload.len() > PAYLOAD_MAX {
            // too large to echo back, refuse without touching storage
            let (section, name) = match (tokens.section, tokens.name) {
                (Some(section), Some(name)) => (section, name),
                _ => return,
            };
            let pos = inner
                .settings
                .iter()
                .position(|s| s.section == section && s.name == name && !s.watchonly);
            if let Some(pos) = pos {
                self.send_write_response(inner, pos, WriteResult::VALUE_REJECTED);
            }
            return;
        }

        match update_value_filtered(
            &inner.types,
            &mut inner.settings,
            payload,
            UpdateFilter::SKIP_WATCHONLY,
        ) {
            Some((pos, status)) => self.send_write_response(inner, pos, status),
            // unknown setting or watch-only: not ours to answer
            None => {}
        }
    }

    fn handle_write_resp(&self, payload: &[u8]) {
        let (status, setting) = match payload.split_first() {
            Some((&status, rest)) => (status, rest),
            None => {
                warn!("empty write resp");
                return;
            }
        };
        let status = match WriteResult::try_from(status) {
            Ok(status) => status,
            Err(_) => {
                warn!("write resp with unknown status {status}");
                return;
            }
        };

        let mut guard = lock(&self.inner);
        let inner = &mut *guard;

        if status == WriteResult::OK {
            // keep watchers in sync with the accepted write; our own
            // entries were already updated when we answered the WRITE
            let updated = update_value_filtered(
                &inner.types,
                &mut inner.settings,
                setting,
                UpdateFilter::SKIP_OWNED,
            );
            if matches!(updated, Some((_, res)) if res != WriteResult::OK) {
                warn!("error updating watched setting from write resp");
            }
        }

        if let Some(req) = request::lookup_mut(&mut inner.requests, setting, MsgId::WRITE) {
            req.status = status;
            if req.complete(MsgId::WRITE) {
                self.wake(req);
            }
        }
    }

    fn handle_read_resp(&self, payload: &[u8]) {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;

        let req = match request::lookup_mut(&mut inner.requests, payload, MsgId::READ_REQ) {
            Some(req) => req,
            None => return,
        };

        // watch priming: the reply initializes watch-only entries
        let updated = update_value_filtered(
            &inner.types,
            &mut inner.settings,
            payload,
            UpdateFilter::SKIP_READONLY | UpdateFilter::SKIP_OWNED,
        );
        if matches!(updated, Some((_, res)) if res != WriteResult::OK) {
            warn!("error in settings read response message");
        }

        let (count, tokens) = parse_tokens(payload);
        if count >= TokenCount::Value {
            req.resp_value = tokens.value.map(str::to_owned);
            req.resp_type = tokens.fmt_type.map(str::to_owned);
        } else {
            warn!("read response parsing failed");
            req.resp_value = None;
            req.resp_type = None;
        }

        if req.complete(MsgId::READ_REQ) {
            self.wake(req);
        }
    }

    fn handle_read_by_index_resp(&self, payload: &[u8]) {
        if payload.len() < 2 {
            warn!("short read by idx resp");
            return;
        }

        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        let req = match request::lookup_mut(&mut inner.requests, payload, MsgId::READ_BY_INDEX_REQ)
        {
            Some(req) => req,
            None => return,
        };

        let (count, tokens) = parse_tokens(&payload[2..]);
        if count > TokenCount::Empty {
            req.resp_section = tokens.section.map(str::to_owned);
            req.resp_name = tokens.name.map(str::to_owned);
            req.resp_value = tokens.value.map(str::to_owned);
            req.resp_type = tokens.fmt_type.map(str::to_owned);
        }

        if req.complete(MsgId::READ_BY_INDEX_REQ) {
            self.wake(req);
        }
    }

    fn handle_read_by_index_done(&self) {
        let mut guard = lock(&self.inner);
        // the end marker collapses every pending enumeration at once
        for req in guard.requests.iter_mut() {
            if req.pending && req.msg_id == MsgId::READ_BY_INDEX_REQ {
                req.done = true;
                if req.complete(MsgId::READ_BY_INDEX_REQ) {
                    self.wake(req);
                }
            }
        }
    }

    fn send_write_response(&self, inner: &Inner, pos: usize, status: WriteResult) {
        let entry = &inner.settings[pos];
        let (setting, _) = match entry.format(&inner.types, false) {
            Some(formatted) => formatted,
            None => return,
        };
        let mut resp = Vec::with_capacity(setting.len() + 1);
        resp.push(status.into());
        resp.extend_from_slice(&setting);
        if resp.len() > PAYLOAD_MAX {
            warn!("write response for {}.{} overflows", entry.section, entry.name);
            return;
        }
        if self.host.send(MsgId::WRITE_RESP.into(), &resp).is_err() {
            error!("sending settings write response failed");
        }
    }

    fn wake(&self, req: &RequestState) {
        match &req.event {
            Some(event) => event.signal(),
            None => self.host.signal(),
        }
    }
}

impl Drop for SettingsCore {
    fn drop(&mut self) {
        let subs = std::mem::take(&mut lock(&self.inner).subs);
        for (msg_id, handle) in subs {
            if self.host.unregister_cb(handle).is_err() {
                error!(
                    "error unregistering callback for msg id {}",
                    u16::from(msg_id)
                );
            }
        }
    }
}

/// Parse `payload` and run the matching entry's value update, unless the
/// filter says the entry is not this site's to touch. Returns the entry's
/// index and the update result when one ran.
fn update_value_filtered(
    types: &TypeRegistry,
    settings: &mut [SettingData],
    payload: &[u8],
    filter: UpdateFilter,
) -> Option<(usize, WriteResult)> {
    let (count, tokens) = parse_tokens(payload);
    if count < TokenCount::Value {
        warn!("error parsing setting tokens");
        return None;
    }
    let (section, name, value) = match (tokens.section, tokens.name, tokens.value) {
        (Some(section), Some(name), Some(value)) => (section, name, value),
        _ => return None,
    };

    let pos = settings
        .iter()
        .position(|s| s.section == section && s.name == name)?;
    let entry = &mut settings[pos];
    if filter.contains(UpdateFilter::SKIP_READONLY) && entry.readonly {
        return None;
    }
    if filter.contains(UpdateFilter::SKIP_WATCHONLY) && entry.watchonly {
        return None;
    }
    if filter.contains(UpdateFilter::SKIP_OWNED) && !entry.readonly && !entry.watchonly {
        return None;
    }

    Some((pos, entry.update_value(types, value)))
}
