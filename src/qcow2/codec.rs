//! Encryption and compression as injected external collaborators (spec §1,
//! design note "dynamic dispatch" in §9). The engine never implements AES,
//! LUKS key derivation, or a compression algorithm itself — it consumes a
//! narrow capability surface.

use crate::error::Result;

/// Encrypts or decrypts fixed-size sectors, tweaked by absolute host sector
/// number. Implementations (legacy AES-CBC, LUKS1/2 + XTS) live outside
/// this crate.
pub trait SectorCodec: Send + Sync {
    /// Sector size this codec operates on; QCOW2 always uses 512.
    fn sector_size(&self) -> u64 {
        512
    }

    fn encrypt_sector(&self, sector_number: u64, buf: &mut [u8]) -> Result<()>;
    fn decrypt_sector(&self, sector_number: u64, buf: &mut [u8]) -> Result<()>;
}

/// Builds a [`SectorCodec`] from a password and the on-disk encryption
/// header region (offset + length, per `Header::crypto_header`). Returns
/// `WrongPassword` when the password does not unlock the header.
pub trait CodecFactory: Send + Sync {
    fn derive(&self, password: &str, header_region: &[u8]) -> Result<Box<dyn SectorCodec>>;
}

/// A compression codec as an injected function pair, per spec §1
/// ("compression codecs are likewise injected as `(compress, decompress)`
/// function pairs").
pub struct CompressionCodec {
    pub name: &'static str,
    pub compress: fn(&[u8]) -> Result<Vec<u8>>,
    pub decompress: fn(&[u8], usize) -> Result<Vec<u8>>,
}

impl CompressionCodec {
    pub fn decompress(&self, payload: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        (self.decompress)(payload, expected_len)
    }

    pub fn compress(&self, plain: &[u8]) -> Result<Vec<u8>> {
        (self.compress)(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct IdentityCodec;
    impl SectorCodec for IdentityCodec {
        fn encrypt_sector(&self, _sector_number: u64, _buf: &mut [u8]) -> Result<()> {
            Ok(())
        }
        fn decrypt_sector(&self, _sector_number: u64, _buf: &mut [u8]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn identity_codec_round_trips() {
        let codec = IdentityCodec;
        let mut buf = [1u8, 2, 3];
        codec.encrypt_sector(0, &mut buf).unwrap();
        codec.decrypt_sector(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }
}
