//! AES primitives used by the container stack.
//!
//! Three modes are involved when opening Switch content:
//! - AES-128-ECB for key-area and title-key unwrapping,
//! - AES-128-CTR for section data (see [`crate::io::CtrSource`]),
//! - AES-128-XTS with Nintendo's byte-swapped tweak for NCA headers.

use aes::Aes128;
use cipher::{generic_array::GenericArray, BlockDecrypt, KeyInit};
use xts_mode::Xts128;

/// AES block size, also the CTR counter granularity.
pub const AES_BLOCK_SIZE: usize = 0x10;
/// Sector size used by the Nintendo XTS variant.
pub const XTS_SECTOR_SIZE: usize = 0x200;

pub type AesKey = [u8; 0x10];
pub type AesXtsKey = [u8; 0x20];

/// Builds a tweak for Nintendo XTS operations.
///
/// Standard XTS stores the sector index little-endian; Nintendo stores it
/// big-endian, so the whole 128-bit index is byte-swapped.
pub fn nintendo_tweak(sector_index: u128) -> [u8; 0x10] {
    sector_index.to_be_bytes()
}

/// Builds the 128-bit CTR IV `[nonce_be:8 | counter_be:8]`.
pub fn ctr_iv(nonce: u64, block_counter: u64) -> [u8; 0x10] {
    (((nonce as u128) << 64) | block_counter as u128).to_be_bytes()
}

/// Decrypts a buffer in place with AES-128-ECB, block by block.
///
/// The buffer length must be a multiple of 16 bytes.
pub fn decrypt_ecb(key: &AesKey, data: &mut [u8]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
}

/// Creates the XTS128 cipher used for NCA header decryption.
///
/// The 32-byte header key is split into two 128-bit halves: data unit key
/// first, tweak key second.
pub fn header_cipher(header_key: &AesXtsKey) -> Xts128<Aes128> {
    let cipher_1 = Aes128::new(GenericArray::from_slice(&header_key[..0x10]));
    let cipher_2 = Aes128::new(GenericArray::from_slice(&header_key[0x10..]));
    Xts128::new(cipher_1, cipher_2)
}

/// Decrypts `data` in place as consecutive 0x200-byte Nintendo-XTS sectors,
/// starting at `first_sector`.
pub fn decrypt_header_area(xts: &Xts128<Aes128>, data: &mut [u8], first_sector: u128) {
    xts.decrypt_area(data, XTS_SECTOR_SIZE, first_sector, nintendo_tweak);
}

/// Derives a key encryption key from its source material.
///
/// `k1 = ECB_dec(master_key, kek_seed); k2 = ECB_dec(k1, src);
/// k3 = ECB_dec(k2, key_seed)`.
pub fn gen_aes_kek(src: &AesKey, master_key: &AesKey, kek_seed: &AesKey, key_seed: &AesKey) -> AesKey {
    let mut key = *kek_seed;
    decrypt_ecb(master_key, &mut key);
    let mut kek = *src;
    decrypt_ecb(&key, &mut kek);
    let mut out = *key_seed;
    decrypt_ecb(&kek, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipher::BlockEncrypt;
    use xts_mode::get_tweak_default;

    #[test]
    fn test_nintendo_tweak_generation() {
        let sector = 0x01020304_u128;
        let tweak = nintendo_tweak(sector);
        let expected = [
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02,
            0x03, 0x04,
        ];
        assert_eq!(tweak, expected);
    }

    #[test]
    fn test_nintendo_standard_tweak_difference() {
        let sector = 0x0102030405060708_u128;
        assert_ne!(nintendo_tweak(sector), get_tweak_default(sector));
        // Sector 0 tweaks coincide, so decryption of sector 0 matches standard XTS.
        assert_eq!(nintendo_tweak(0), get_tweak_default(0));
    }

    #[test]
    fn test_xts_sector_tweak_affects_output() {
        let key: AesXtsKey = [0x11; 0x20];
        let xts = header_cipher(&key);

        let plain = [0xAB_u8; XTS_SECTOR_SIZE];
        let mut sector0 = plain;
        let mut sector1 = plain;
        xts.encrypt_area(&mut sector0, XTS_SECTOR_SIZE, 0, nintendo_tweak);
        xts.encrypt_area(&mut sector1, XTS_SECTOR_SIZE, 1, nintendo_tweak);
        assert_ne!(sector0, sector1);

        decrypt_header_area(&xts, &mut sector0, 0);
        decrypt_header_area(&xts, &mut sector1, 1);
        assert_eq!(sector0, plain);
        assert_eq!(sector1, plain);
    }

    #[test]
    fn test_ctr_iv_layout() {
        let iv = ctr_iv(0x1122334455667788, 0xC0);
        assert_eq!(&iv[..8], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(
            &iv[8..],
            &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC0]
        );
    }

    #[test]
    fn test_gen_aes_kek_chain() {
        let src: AesKey = [0x01; 0x10];
        let mkey: AesKey = [0x02; 0x10];
        let kek_seed: AesKey = [0x03; 0x10];
        let key_seed: AesKey = [0x04; 0x10];

        let derived = gen_aes_kek(&src, &mkey, &kek_seed, &key_seed);

        // Walk the chain backwards: encrypting the result with the
        // intermediate keys must reproduce the seeds.
        let mut k1 = kek_seed;
        decrypt_ecb(&mkey, &mut k1);
        let mut k2 = src;
        decrypt_ecb(&k1, &mut k2);

        let cipher = Aes128::new(GenericArray::from_slice(&k2));
        let mut block = GenericArray::clone_from_slice(&derived);
        cipher.encrypt_block(&mut block);
        assert_eq!(block.as_slice(), &key_seed);
    }

    #[test]
    fn test_ecb_multi_block() {
        let key: AesKey = [0x5A; 0x10];
        let cipher = Aes128::new(GenericArray::from_slice(&key));

        let plain = [0x42_u8; 0x40];
        let mut buf = plain;
        for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        decrypt_ecb(&key, &mut buf);
        assert_eq!(buf, plain);
    }
}
