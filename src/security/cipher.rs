use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use tracing::warn;

use crate::error::{RelayError, RelayResult};

// Envelope layout after AES-256-CBC decryption (IV = key[..16]):
//
//   [0..16)    random prefix
//   [16..20)   content length N, big-endian u32
//   [20..20+N) content
//   [20+N..)   receive id trailer, then PKCS#7 padding to a 32-byte boundary

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const BLOCK_SIZE: usize = 16;
const PREFIX_LEN: usize = 16;
const HEADER_LEN: usize = PREFIX_LEN + 4;
const MAX_PAD: usize = 32;

// Encoding keys are 43 random base64 characters, so the final character
// usually carries non-zero trailing bits.
const LENIENT_B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// AES-256-CBC codec for callback envelopes.
#[derive(Clone)]
pub struct PayloadCipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher").finish_non_exhaustive()
    }
}

impl PayloadCipher {
    /// Build a cipher from raw key bytes.
    pub fn new(key: &[u8]) -> RelayResult<Self> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| RelayError::KeyLength(key.len()))?;
        Ok(Self { key })
    }

    /// Build a cipher from the 43-character configured encoding key.
    pub fn from_encoding_key(encoding_key: &str) -> RelayResult<Self> {
        Self::new(&decode_encoding_key(encoding_key)?)
    }

    fn iv(&self) -> &[u8] {
        &self.key[..BLOCK_SIZE]
    }

    /// Decrypt raw ciphertext and return the content section of the envelope.
    pub fn open(&self, mut buf: Vec<u8>) -> RelayResult<Vec<u8>> {
        if buf.len() < BLOCK_SIZE || buf.len() % BLOCK_SIZE != 0 {
            return Err(RelayError::MalformedCiphertext(buf.len()));
        }

        let len = buf.len();
        Aes256CbcDec::new_from_slices(&self.key, self.iv())
            .map_err(|_| RelayError::KeyLength(self.key.len()))?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| RelayError::MalformedCiphertext(len))?;

        let pad = match buf.last().copied().map(usize::from) {
            Some(p) if (1..=MAX_PAD).contains(&p) => p,
            other => {
                warn!(
                    pad_byte = ?other,
                    "padding byte out of range, keeping full buffer (corrupt input or wrong key)"
                );
                0
            }
        };
        buf.truncate(buf.len().saturating_sub(pad));

        if buf.len() < HEADER_LEN {
            return Err(RelayError::TruncatedPayload {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }

        let declared = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize;
        let end = HEADER_LEN
            .checked_add(declared)
            .filter(|end| *end <= buf.len())
            .ok_or(RelayError::TruncatedPayload {
                needed: HEADER_LEN.saturating_add(declared),
                available: buf.len(),
            })?;

        buf.truncate(end);
        buf.drain(..HEADER_LEN);
        Ok(buf)
    }

    /// Decode a base64 envelope and return its content.
    pub fn decrypt(&self, envelope_b64: &str) -> RelayResult<Vec<u8>> {
        let buf = LENIENT_B64
            .decode(envelope_b64)
            .map_err(RelayError::EnvelopeDecode)?;
        self.open(buf)
    }

    /// Produce a base64 envelope in the vendor format.
    ///
    /// `prefix` should be fresh random bytes for every message.
    pub fn encrypt(
        &self,
        prefix: &[u8; PREFIX_LEN],
        content: &[u8],
        receive_id: &str,
    ) -> RelayResult<String> {
        let length = length_field(content.len())?;
        let mut buf = Vec::with_capacity(HEADER_LEN + content.len() + receive_id.len() + MAX_PAD);
        buf.extend_from_slice(prefix);
        buf.extend_from_slice(&length);
        buf.extend_from_slice(content);
        buf.extend_from_slice(receive_id.as_bytes());

        let pad = MAX_PAD - (buf.len() % MAX_PAD);
        buf.resize(buf.len() + pad, pad as u8);

        Ok(LENIENT_B64.encode(self.seal(&buf)))
    }

    /// Encrypt a buffer that is already a multiple of the block size.
    fn seal(&self, buf: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(self.key.as_slice().into(), self.iv().into())
            .encrypt_padded_vec_mut::<NoPadding>(buf)
    }
}

fn length_field(len: usize) -> RelayResult<[u8; 4]> {
    u32::try_from(len)
        .map(u32::to_be_bytes)
        .map_err(|_| RelayError::PayloadTooLarge(len))
}

fn decode_encoding_key(encoding_key: &str) -> RelayResult<Vec<u8>> {
    LENIENT_B64
        .decode(format!("{encoding_key}="))
        .map_err(RelayError::KeyDecode)
}

/// Decrypt a callback echo string with the configured encoding key.
///
/// Failure points, in order: key decoding, envelope decoding, key length,
/// block alignment, declared content length.
pub fn decrypt_echo(encoding_key: &str, envelope_b64: &str) -> RelayResult<Vec<u8>> {
    let key = decode_encoding_key(encoding_key)?;
    let buf = LENIENT_B64
        .decode(envelope_b64)
        .map_err(RelayError::EnvelopeDecode)?;
    PayloadCipher::new(&key)?.open(buf)
}
