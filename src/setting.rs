//! Setting entries: caller-shared storage, shadow copies, and
//! update-with-revert semantics.

use std::fmt;
use std::sync::{Arc, Mutex};

use color_eyre::eyre::ensure;
use color_eyre::Result;
use log::warn;

use crate::lock;
use crate::proto::{format_tokens, ProtocolError, WriteResult};
use crate::types::{SettingType, TypeRegistry};

/// Notify hook invoked after a setting's storage has been updated.
/// Returning anything other than [`WriteResult::OK`] reverts the storage
/// and propagates the code in the write response.
pub type NotifyFn = Box<dyn Fn() -> WriteResult + Send + Sync>;

/// Caller-shared storage for one setting value.
///
/// The cell holds a fixed-length byte blob; the library decodes accepted
/// writes into it in place, and the owner reads it back through the typed
/// accessors. The blob's length is fixed at construction and selects the
/// codec width (e.g. a 2-byte blob holds an `i16` setting).
#[derive(Clone)]
pub struct SettingValue {
    blob: Arc<Mutex<Vec<u8>>>,
}

impl SettingValue {
    fn from_bytes(bytes: Vec<u8>) -> Self {
        SettingValue {
            blob: Arc::new(Mutex::new(bytes)),
        }
    }

    /// 1-byte signed integer storage.
    pub fn of_i8(value: i8) -> Self {
        Self::from_bytes(value.to_ne_bytes().to_vec())
    }

    /// 2-byte signed integer storage.
    pub fn of_i16(value: i16) -> Self {
        Self::from_bytes(value.to_ne_bytes().to_vec())
    }

    /// 4-byte signed integer storage.
    pub fn of_i32(value: i32) -> Self {
        Self::from_bytes(value.to_ne_bytes().to_vec())
    }

    /// Single-precision float storage.
    pub fn of_f32(value: f32) -> Self {
        Self::from_bytes(value.to_ne_bytes().to_vec())
    }

    /// Double-precision float storage.
    pub fn of_f64(value: f64) -> Self {
        Self::from_bytes(value.to_ne_bytes().to_vec())
    }

    /// String storage of `capacity` bytes (content plus terminating NUL).
    /// Fails when `initial` does not fit the capacity.
    pub fn of_str(capacity: usize, initial: &str) -> Result<Self> {
        ensure!(
            initial.len() < capacity,
            ProtocolError::new("initial string does not fit the storage capacity")
        );
        let mut bytes = vec![0u8; capacity];
        bytes[..initial.len()].copy_from_slice(initial.as_bytes());
        Ok(Self::from_bytes(bytes))
    }

    /// Boolean storage (a 1-byte enum index).
    pub fn of_bool(value: bool) -> Self {
        Self::from_bytes(vec![value as u8])
    }

    /// Enum storage holding a name-table index.
    pub fn of_enum(index: u8) -> Self {
        Self::from_bytes(vec![index])
    }

    pub fn as_i8(&self) -> Option<i8> {
        let blob = lock(&self.blob);
        Some(i8::from_ne_bytes([*blob.first()?]))
    }

    pub fn as_i16(&self) -> Option<i16> {
        let blob = lock(&self.blob);
        let bytes: [u8; 2] = blob.as_slice().try_into().ok()?;
        Some(i16::from_ne_bytes(bytes))
    }

    pub fn as_i32(&self) -> Option<i32> {
        let blob = lock(&self.blob);
        let bytes: [u8; 4] = blob.as_slice().try_into().ok()?;
        Some(i32::from_ne_bytes(bytes))
    }

    pub fn as_f32(&self) -> Option<f32> {
        let blob = lock(&self.blob);
        let bytes: [u8; 4] = blob.as_slice().try_into().ok()?;
        Some(f32::from_ne_bytes(bytes))
    }

    pub fn as_f64(&self) -> Option<f64> {
        let blob = lock(&self.blob);
        let bytes: [u8; 8] = blob.as_slice().try_into().ok()?;
        Some(f64::from_ne_bytes(bytes))
    }

    /// Text content up to the first NUL.
    pub fn as_str(&self) -> Option<String> {
        let blob = lock(&self.blob);
        let end = blob.iter().position(|&b| b == 0).unwrap_or(blob.len());
        std::str::from_utf8(&blob[..end]).ok().map(str::to_owned)
    }

    pub fn as_bool(&self) -> Option<bool> {
        Some(*lock(&self.blob).first()? != 0)
    }

    /// Raw copy of the storage bytes.
    pub fn bytes(&self) -> Vec<u8> {
        lock(&self.blob).clone()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.blob).len()
    }

    pub(crate) fn snapshot(&self) -> Vec<u8> {
        lock(&self.blob).clone()
    }

    pub(crate) fn restore(&self, bytes: &[u8]) {
        lock(&self.blob).copy_from_slice(bytes);
    }

    pub(crate) fn with_blob<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut lock(&self.blob))
    }
}

impl fmt::Debug for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SettingValue").field(&self.bytes()).finish()
    }
}

/// One registered or watched setting.
pub(crate) struct SettingData {
    pub section: String,
    pub name: String,
    pub value: SettingValue,
    /// Pre-write snapshot, used to revert a rejected update.
    shadow: Vec<u8>,
    pub ty: SettingType,
    pub notify: Option<NotifyFn>,
    pub readonly: bool,
    pub watchonly: bool,
}

impl SettingData {
    pub fn new(
        section: &str,
        name: &str,
        value: SettingValue,
        ty: SettingType,
        notify: Option<NotifyFn>,
        readonly: bool,
        watchonly: bool,
    ) -> Self {
        let shadow = vec![0u8; value.len()];
        SettingData {
            section: section.to_owned(),
            name: name.to_owned(),
            value,
            shadow,
            ty,
            notify,
            readonly,
            watchonly,
        }
    }

    /// Parse `text` into the storage, reverting on failure or rejection.
    ///
    /// The notify hook runs after the storage is updated; for watched
    /// settings its return value is advisory only.
    pub fn update_value(&mut self, types: &TypeRegistry, text: &str) -> WriteResult {
        if self.readonly {
            return WriteResult::READ_ONLY;
        }

        let codec = match types.lookup(self.ty) {
            Some(codec) => codec,
            None => {
                warn!("setting {}.{} has an unknown type", self.section, self.name);
                return WriteResult::SERVICE_FAILED;
            }
        };

        self.shadow = self.value.snapshot();
        if !self.value.with_blob(|blob| codec.from_text(blob, text)) {
            self.value.restore(&self.shadow);
            return WriteResult::PARSE_FAILED;
        }

        let notify = match &self.notify {
            Some(notify) => notify,
            None => return WriteResult::OK,
        };

        let result = notify();

        if self.watchonly {
            // watchers only track the value, their verdict changes nothing
            return WriteResult::OK;
        }

        if result != WriteResult::OK {
            self.value.restore(&self.shadow);
        }

        result
    }

    /// Format `section\0name\0value\0[type\0]`, returning the payload and
    /// the header length (up to and including the NUL after `name`).
    pub fn format(&self, types: &TypeRegistry, with_type: bool) -> Option<(Vec<u8>, usize)> {
        let codec = types.lookup(self.ty)?;
        let value = self.value.with_blob(|blob| codec.to_text(blob))?;
        let type_text = if with_type {
            Some(
                codec
                    .format_type()
                    .unwrap_or_else(|| self.ty.index().to_string()),
            )
        } else {
            None
        };
        let payload = format_tokens(
            Some(&self.section),
            Some(&self.name),
            Some(&value),
            type_text.as_deref(),
        )?;
        Some((payload, self.section.len() + self.name.len() + 2))
    }
}

/// Insert preserving section locality: after the last entry of the same
/// section if one exists, else at the tail.
pub(crate) fn insert_setting(list: &mut Vec<SettingData>, entry: SettingData) {
    match list.iter().rposition(|s| s.section == entry.section) {
        Some(pos) => list.insert(pos + 1, entry),
        None => list.push(entry),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn entry(value: SettingValue, ty: SettingType) -> SettingData {
        SettingData::new("sec", "nam", value, ty, None, false, false)
    }

    #[test]
    fn update_applies_parsed_value() {
        let types = TypeRegistry::new();
        let value = SettingValue::of_i32(5);
        let mut setting = entry(value.clone(), SettingType::INT);

        assert_eq!(setting.update_value(&types, "7"), WriteResult::OK);
        assert_eq!(value.as_i32(), Some(7));
    }

    #[test]
    fn update_reverts_on_parse_failure() {
        let types = TypeRegistry::new();
        let value = SettingValue::of_i32(5);
        let before = value.bytes();
        let mut setting = entry(value.clone(), SettingType::INT);

        assert_eq!(setting.update_value(&types, "bogus"), WriteResult::PARSE_FAILED);
        assert_eq!(value.bytes(), before);
    }

    #[test]
    fn update_reverts_when_notify_rejects() {
        let types = TypeRegistry::new();
        let value = SettingValue::of_i32(5);
        let before = value.bytes();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut setting = SettingData::new(
            "sec",
            "nam",
            value.clone(),
            SettingType::INT,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                WriteResult::VALUE_REJECTED
            })),
            false,
            false,
        );

        assert_eq!(setting.update_value(&types, "7"), WriteResult::VALUE_REJECTED);
        assert_eq!(value.bytes(), before);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notify_is_not_invoked_on_parse_failure() {
        let types = TypeRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut setting = SettingData::new(
            "sec",
            "nam",
            SettingValue::of_i32(5),
            SettingType::INT,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                WriteResult::OK
            })),
            false,
            false,
        );

        assert_eq!(setting.update_value(&types, "x"), WriteResult::PARSE_FAILED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn readonly_refuses_updates() {
        let types = TypeRegistry::new();
        let value = SettingValue::of_i32(5);
        let mut setting =
            SettingData::new("sec", "nam", value.clone(), SettingType::INT, None, true, false);

        assert_eq!(setting.update_value(&types, "7"), WriteResult::READ_ONLY);
        assert_eq!(value.as_i32(), Some(5));
    }

    #[test]
    fn watchonly_notify_is_advisory() {
        let types = TypeRegistry::new();
        let value = SettingValue::of_i32(5);
        let mut setting = SettingData::new(
            "sec",
            "nam",
            value.clone(),
            SettingType::INT,
            Some(Box::new(|| WriteResult::VALUE_REJECTED)),
            false,
            true,
        );

        // the rejection is ignored and the new value sticks
        assert_eq!(setting.update_value(&types, "9"), WriteResult::OK);
        assert_eq!(value.as_i32(), Some(9));
    }

    #[test]
    fn format_with_and_without_type() {
        let types = TypeRegistry::new();
        let setting = entry(SettingValue::of_i32(10), SettingType::INT);

        let (payload, header_len) = setting.format(&types, true).unwrap();
        assert_eq!(payload, b"sec\0nam\x0010\x000\0");
        assert_eq!(header_len, 8);
        assert_eq!(&payload[..header_len], b"sec\0nam\0");

        let (payload, _) = setting.format(&types, false).unwrap();
        assert_eq!(payload, b"sec\0nam\x0010\0");
    }

    #[test]
    fn format_announces_enums_by_descriptor() {
        let types = TypeRegistry::new();
        let setting = entry(SettingValue::of_bool(true), SettingType::BOOL);

        let (payload, _) = setting.format(&types, true).unwrap();
        assert_eq!(payload, b"sec\0nam\0True\0enum:False,True\0");
    }

    #[test]
    fn insert_keeps_sections_together() {
        fn named(section: &str, name: &str) -> SettingData {
            SettingData::new(
                section,
                name,
                SettingValue::of_i32(0),
                SettingType::INT,
                None,
                false,
                false,
            )
        }

        let mut list = Vec::new();
        insert_setting(&mut list, named("sec", "one"));
        insert_setting(&mut list, named("zzz", "first"));
        insert_setting(&mut list, named("sec", "two"));

        let order: Vec<(&str, &str)> = list
            .iter()
            .map(|s| (s.section.as_str(), s.name.as_str()))
            .collect();
        assert_eq!(order, vec![("sec", "one"), ("sec", "two"), ("zzz", "first")]);
    }
}
