//! Console and title key registries.
//!
//! Two registries feed the NCA decryption paths: [`KeySet`] holds console
//! keys (master keys, title keks, the header key and the key-area sources),
//! [`TitleKeySet`] maps rights IDs to per-title keys. Key-file *parsing* is
//! the caller's job; [`KeySet::set_key`] is the boundary. It accepts
//! `name = hexvalue` pairs and silently ignores names it does not recognize.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::crypto::{AesKey, AesXtsKey};
use crate::error::{Error, Result};

pub type RightsId = [u8; 0x10];

/// Number of master key / title kek generations tracked.
pub const MAX_KEY_GENERATION: usize = 0x10;

/// Console keys, populated once at startup and read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct KeySet {
    pub master_keys: [Option<AesKey>; MAX_KEY_GENERATION],
    pub titlekeks: [Option<AesKey>; MAX_KEY_GENERATION],

    pub header_key: Option<AesXtsKey>,

    pub aes_kek_generation_source: Option<AesKey>,
    pub aes_key_generation_source: Option<AesKey>,

    pub key_area_key_application_source: Option<AesKey>,
    pub key_area_key_ocean_source: Option<AesKey>,
    pub key_area_key_system_source: Option<AesKey>,
}

impl KeySet {
    /// Stores a key by its textual id, e.g. `master_key_00` or `header_key`.
    ///
    /// Ids are matched case-insensitively; unrecognized ids are ignored so
    /// that full `prod.keys` dumps can be fed through unchanged. Values that
    /// are not valid hex of the expected width are rejected with a
    /// diagnostic.
    pub fn set_key(&mut self, id: &str, value: &str) {
        let id = id.trim().to_ascii_lowercase();
        let value = value.trim();

        let Ok(data) = hex::decode(value) else {
            tracing::warn!(id = %id, value, "key value is not hexadecimal");
            return;
        };

        match id.as_str() {
            "aes_kek_generation_source" => self.aes_kek_generation_source = aes_key(&id, &data),
            "aes_key_generation_source" => self.aes_key_generation_source = aes_key(&id, &data),
            "key_area_key_application_source" => {
                self.key_area_key_application_source = aes_key(&id, &data)
            }
            "key_area_key_ocean_source" => self.key_area_key_ocean_source = aes_key(&id, &data),
            "key_area_key_system_source" => self.key_area_key_system_source = aes_key(&id, &data),
            "header_key" => self.header_key = xts_key(&id, &data),
            _ => {
                if let Some(gen) = indexed_id(&id, "master_key_") {
                    self.master_keys[gen] = aes_key(&id, &data);
                } else if let Some(gen) = indexed_id(&id, "titlekek_") {
                    self.titlekeks[gen] = aes_key(&id, &data);
                }
            }
        }
    }

    /// Returns the key area encryption key source for an index.
    ///
    /// 0, 1 and 2 select application, ocean and system; any other index
    /// falls back to application.
    pub fn get_kaek(&self, idx: usize) -> Result<AesKey> {
        let (key, name) = match idx {
            1 => (
                self.key_area_key_ocean_source,
                "key_area_key_ocean_source",
            ),
            2 => (
                self.key_area_key_system_source,
                "key_area_key_system_source",
            ),
            _ => (
                self.key_area_key_application_source,
                "key_area_key_application_source",
            ),
        };
        key.ok_or(Error::MissingKey(name))
    }

    pub fn master_key(&self, generation: u8) -> Result<AesKey> {
        self.master_keys
            .get(generation as usize)
            .copied()
            .flatten()
            .ok_or(Error::MissingMasterKey(generation))
    }

    pub fn titlekek(&self, generation: u8) -> Result<AesKey> {
        self.titlekeks
            .get(generation as usize)
            .copied()
            .flatten()
            .ok_or(Error::MissingTitleKek(generation))
    }

    pub fn header_key(&self) -> Result<AesXtsKey> {
        self.header_key.ok_or(Error::MissingKey("header_key"))
    }
}

fn aes_key(id: &str, data: &[u8]) -> Option<AesKey> {
    match data.try_into() {
        Ok(key) => Some(key),
        Err(_) => {
            tracing::warn!(id, len = data.len(), "expected a 16-byte key");
            None
        }
    }
}

fn xts_key(id: &str, data: &[u8]) -> Option<AesXtsKey> {
    match data.try_into() {
        Ok(key) => Some(key),
        Err(_) => {
            tracing::warn!(id, len = data.len(), "expected a 32-byte key");
            None
        }
    }
}

/// Parses `<prefix>XX` ids where XX is a two-digit hex generation below
/// [`MAX_KEY_GENERATION`].
fn indexed_id(id: &str, prefix: &str) -> Option<usize> {
    let digits = id.strip_prefix(prefix)?;
    if digits.len() != 2 {
        return None;
    }
    let gen = usize::from_str_radix(digits, 16).ok()?;
    (gen < MAX_KEY_GENERATION).then_some(gen)
}

/// Title keys, keyed by rights ID.
///
/// An override key, when set, wins over the map for every lookup; the
/// front-ends use it to force a key supplied on the command line.
#[derive(Debug, Default)]
pub struct TitleKeySet {
    override_key: Option<AesKey>,
    map: HashMap<RightsId, AesKey>,
}

impl TitleKeySet {
    pub fn set_key(&mut self, rights_id: RightsId, key: AesKey) {
        self.map.insert(rights_id, key);
    }

    pub fn set_override_key(&mut self, key: AesKey) {
        self.override_key = Some(key);
    }

    pub fn clear_override_key(&mut self) {
        self.override_key = None;
    }

    pub fn get(&self, rights_id: &RightsId) -> Result<AesKey> {
        if let Some(key) = self.override_key {
            return Ok(key);
        }
        self.map
            .get(rights_id)
            .copied()
            .ok_or_else(|| Error::MissingTitleKey(hex::encode(rights_id)))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// The shared key state handed to parsers and the virtual filesystem.
///
/// The console key set is frozen after construction; the title key set sits
/// behind a lock because tickets discovered while mounting insert keys at
/// runtime.
#[derive(Debug, Default)]
pub struct Keys {
    keyset: KeySet,
    title_keys: RwLock<TitleKeySet>,
}

impl Keys {
    pub fn new(keyset: KeySet) -> Self {
        Self {
            keyset,
            title_keys: RwLock::new(TitleKeySet::default()),
        }
    }

    pub fn with_title_keys(keyset: KeySet, title_keys: TitleKeySet) -> Self {
        Self {
            keyset,
            title_keys: RwLock::new(title_keys),
        }
    }

    pub fn keyset(&self) -> &KeySet {
        &self.keyset
    }

    pub fn title_key(&self, rights_id: &RightsId) -> Result<AesKey> {
        self.title_keys.read().unwrap().get(rights_id)
    }

    pub fn set_title_key(&self, rights_id: RightsId, key: AesKey) {
        self.title_keys.write().unwrap().set_key(rights_id, key);
    }

    pub fn set_override_title_key(&self, key: AesKey) {
        self.title_keys.write().unwrap().set_override_key(key);
    }

    pub fn clear_override_title_key(&self) {
        self.title_keys.write().unwrap().clear_override_key();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_set_key_recognized_ids() {
        let mut set = KeySet::default();
        set.set_key("header_key", &("00".repeat(31) + "01"));
        set.set_key("MASTER_KEY_00", "000102030405060708090a0b0c0d0e0f");
        set.set_key("master_key_0f", &"11".repeat(16));
        set.set_key("titlekek_02", &"22".repeat(16));
        set.set_key("aes_kek_generation_source", &"33".repeat(16));

        assert_eq!(set.header_key().unwrap()[31], 0x01);
        assert_eq!(set.master_key(0).unwrap()[1], 0x01);
        assert_eq!(set.master_key(0x0F).unwrap(), [0x11; 16]);
        assert_eq!(set.titlekek(2).unwrap(), [0x22; 16]);
        assert_eq!(set.aes_kek_generation_source.unwrap(), [0x33; 16]);
        assert!(matches!(
            set.master_key(1),
            Err(Error::MissingMasterKey(1))
        ));
    }

    #[test]
    fn test_set_key_ignores_unknown_and_out_of_range() {
        let mut set = KeySet::default();
        set.set_key("some_future_key", &"aa".repeat(16));
        set.set_key("master_key_10", &"aa".repeat(16));
        set.set_key("master_key_xyz", &"aa".repeat(16));

        assert!(set.master_keys.iter().all(Option::is_none));
    }

    #[test]
    #[traced_test]
    fn test_set_key_rejects_non_hex() {
        let mut set = KeySet::default();
        set.set_key("master_key_00", "not hex at all");
        assert!(set.master_keys[0].is_none());
        assert!(logs_contain("not hexadecimal"));
    }

    #[test]
    fn test_kaek_index_fallback() {
        let mut set = KeySet::default();
        set.set_key("key_area_key_application_source", &"01".repeat(16));
        set.set_key("key_area_key_ocean_source", &"02".repeat(16));
        set.set_key("key_area_key_system_source", &"03".repeat(16));

        assert_eq!(set.get_kaek(0).unwrap(), [0x01; 16]);
        assert_eq!(set.get_kaek(1).unwrap(), [0x02; 16]);
        assert_eq!(set.get_kaek(2).unwrap(), [0x03; 16]);
        // Anything else falls back to the application source.
        assert_eq!(set.get_kaek(7).unwrap(), [0x01; 16]);
    }

    #[test]
    fn test_title_key_lookup_and_override() {
        let mut titles = TitleKeySet::default();
        let rid: RightsId = [0xAB; 16];
        titles.set_key(rid, [0x01; 16]);

        assert_eq!(titles.get(&rid).unwrap(), [0x01; 16]);
        assert!(matches!(
            titles.get(&[0u8; 16]),
            Err(Error::MissingTitleKey(_))
        ));

        titles.set_override_key([0xFF; 16]);
        assert_eq!(titles.get(&rid).unwrap(), [0xFF; 16]);
        assert_eq!(titles.get(&[0u8; 16]).unwrap(), [0xFF; 16]);

        titles.clear_override_key();
        assert_eq!(titles.get(&rid).unwrap(), [0x01; 16]);
    }

    #[test]
    fn test_runtime_title_key_insertion() {
        let keys = Keys::new(KeySet::default());
        let rid: RightsId = [0x10; 16];
        assert!(keys.title_key(&rid).is_err());

        keys.set_title_key(rid, [0x42; 16]);
        assert_eq!(keys.title_key(&rid).unwrap(), [0x42; 16]);
    }
}
