//! Container format parsers and format detection.

pub mod hfs0;
pub mod nca;
pub mod pfs0;
pub mod romfs;
pub mod xci;

pub use hfs0::Hfs0;
pub use nca::Nca;
pub use pfs0::Pfs0;
pub use romfs::RomFs;
pub use xci::Xci;

use crate::error::{Error, Result};
use crate::keys::Keys;

/// Number of leading bytes a format probe inspects.
pub const PROBE_SIZE: usize = 0x400;

/// The five recognized container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pfs,
    Hfs,
    RomFs,
    Xci,
    Nca,
}

/// Matches the probe buffer against each format's header, first hit wins.
///
/// NCA detection decrypts a copy of the probe with the header key, so a
/// missing header key simply means NCAs are never recognized.
pub fn detect(probe: &[u8; PROBE_SIZE], keys: &Keys) -> Option<Format> {
    if probe[..4] == *b"PFS0" {
        Some(Format::Pfs)
    } else if probe[..4] == *b"HFS0" {
        Some(Format::Hfs)
    } else if u64::from_le_bytes(probe[..8].try_into().unwrap()) == romfs::RomFsHeader::SIZE {
        Some(Format::RomFs)
    } else if probe[0x100..0x104] == *b"HEAD" {
        Some(Format::Xci)
    } else if Nca::matches(probe, keys) {
        Some(Format::Nca)
    } else {
        None
    }
}

/// Resolves a NUL-terminated name from a string table.
pub(crate) fn name_at(table: &[u8], offset: usize, what: &'static str) -> Result<String> {
    let bytes = table.get(offset..).ok_or_else(|| {
        Error::InconsistentTable(what, format!("name offset {offset:#x} out of bounds"))
    })?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end])
        .map(str::to_owned)
        .map_err(|e| Error::InconsistentTable(what, e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::fixtures::{build_hfs0, build_pfs0, build_romfs, build_xci};
    use super::*;
    use crate::keys::KeySet;

    fn probe_of(image: &[u8]) -> [u8; PROBE_SIZE] {
        let mut probe = [0u8; PROBE_SIZE];
        let n = image.len().min(PROBE_SIZE);
        probe[..n].copy_from_slice(&image[..n]);
        probe
    }

    #[test]
    fn test_detect_order_and_magics() {
        let keys = Keys::new(KeySet::default());

        let pfs = build_pfs0(&[("f", b"x")]);
        assert_eq!(detect(&probe_of(&pfs), &keys), Some(Format::Pfs));

        let hfs = build_hfs0(&[("f", b"x")]);
        assert_eq!(detect(&probe_of(&hfs), &keys), Some(Format::Hfs));

        let romfs = build_romfs(&[("/f", b"x")]);
        assert_eq!(detect(&probe_of(&romfs), &keys), Some(Format::RomFs));

        let xci = build_xci(&[("secure", build_hfs0(&[]))]);
        assert_eq!(detect(&probe_of(&xci), &keys), Some(Format::Xci));

        assert_eq!(detect(&[0u8; PROBE_SIZE], &keys), None);
    }
}
