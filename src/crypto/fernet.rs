use super::CryptoError;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// base64url, padded on output, padding optional on input.
pub(crate) const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const VERSION: u8 = 0x80;
/// Tokens further than this from the server's clock are rejected either way.
const MAX_SKEW_SECS: i64 = 120;
const HEADER_LEN: usize = 1 + 8 + 16;
const MAC_LEN: usize = 32;

/// Fernet tokens: version, big-endian seconds timestamp, IV, AES-128-CBC
/// ciphertext, HMAC-SHA256 over all of the above, base64url encoded.
#[derive(Clone)]
pub struct Fernet {
    signer: HmacSha256,
    encryption_key: [u8; 16],
}

impl std::fmt::Debug for Fernet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Fernet(..)")
    }
}

impl Fernet {
    /// Takes the 32 byte key as base64url; signing key first, then encryption key.
    pub fn new(key: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_LENIENT
            .decode(key.trim())
            .map_err(|_| CryptoError::InvalidKey)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey);
        }
        let signer = <HmacSha256 as Mac>::new_from_slice(&bytes[..16])
            .map_err(|_| CryptoError::InvalidKey)?;
        let mut encryption_key = [0u8; 16];
        encryption_key.copy_from_slice(&bytes[16..]);
        Ok(Self {
            signer,
            encryption_key,
        })
    }

    pub fn generate_key() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_LENIENT.encode(bytes)
    }

    pub fn encrypt(&self, message: &[u8], server_now_ms: i64) -> String {
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);
        self.encrypt_at(message, server_now_ms.div_euclid(1000) as u64, iv)
    }

    fn encrypt_at(&self, message: &[u8], timestamp_secs: u64, iv: [u8; 16]) -> String {
        let ciphertext = Aes128CbcEnc::new(&self.encryption_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(message);

        let mut token = Vec::with_capacity(HEADER_LEN + ciphertext.len() + MAC_LEN);
        token.push(VERSION);
        token.extend_from_slice(&timestamp_secs.to_be_bytes());
        token.extend_from_slice(&iv);
        token.extend_from_slice(&ciphertext);

        let mut mac = self.signer.clone();
        mac.update(&token);
        token.extend_from_slice(&mac.finalize().into_bytes());
        URL_SAFE_LENIENT.encode(token)
    }

    /// Verifies and decrypts `token`. Freshness is judged against the
    /// supplied server time, never the device clock.
    pub fn decrypt(&self, token: &str, server_now_ms: i64) -> Result<Vec<u8>, CryptoError> {
        let bytes = URL_SAFE_LENIENT
            .decode(token.trim())
            .map_err(|_| CryptoError::InvalidToken)?;
        if bytes.len() < HEADER_LEN + 16 + MAC_LEN || bytes[0] != VERSION {
            return Err(CryptoError::InvalidToken);
        }
        let (signed, signature) = bytes.split_at(bytes.len() - MAC_LEN);
        let mut mac = self.signer.clone();
        mac.update(signed);
        mac.verify_slice(signature)
            .map_err(|_| CryptoError::BadSignature)?;

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&signed[1..9]);
        let token_secs = u64::from_be_bytes(ts) as i64;
        let now_secs = server_now_ms.div_euclid(1000);
        if token_secs < now_secs - MAX_SKEW_SECS {
            return Err(CryptoError::Expired);
        }
        if token_secs > now_secs + MAX_SKEW_SECS {
            return Err(CryptoError::FromFuture);
        }

        let mut iv = [0u8; 16];
        iv.copy_from_slice(&signed[9..HEADER_LEN]);
        let ciphertext = &signed[HEADER_LEN..];
        Aes128CbcDec::new(&self.encryption_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    pub fn decrypt_string(&self, token: &str, server_now_ms: i64) -> Result<String, CryptoError> {
        let bytes = self.decrypt(token, server_now_ms)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW_MS: i64 = 1_700_000_000_000;

    #[test]
    fn round_trip_within_window() {
        let f = Fernet::new(&Fernet::generate_key()).unwrap();
        let token = f.encrypt(b"hello journal", NOW_MS);
        assert_eq!(f.decrypt(&token, NOW_MS + 119_000).unwrap(), b"hello journal");
        assert_eq!(f.decrypt_string(&token, NOW_MS - 119_000).unwrap(), "hello journal");
    }

    #[test]
    fn skew_beyond_two_minutes_is_rejected() {
        let f = Fernet::new(&Fernet::generate_key()).unwrap();
        let token = f.encrypt(b"x", NOW_MS);
        assert_eq!(f.decrypt(&token, NOW_MS + 121_000), Err(CryptoError::Expired));
        assert_eq!(f.decrypt(&token, NOW_MS - 121_000), Err(CryptoError::FromFuture));
    }

    #[test]
    fn tampering_breaks_signature() {
        let f = Fernet::new(&Fernet::generate_key()).unwrap();
        let token = f.encrypt(b"secret", NOW_MS);
        let mut raw = URL_SAFE_LENIENT.decode(&token).unwrap();
        let i = raw.len() - MAC_LEN - 1;
        raw[i] ^= 1;
        let tampered = URL_SAFE_LENIENT.encode(raw);
        assert_eq!(f.decrypt(&tampered, NOW_MS), Err(CryptoError::BadSignature));

        let other = Fernet::new(&Fernet::generate_key()).unwrap();
        assert_eq!(other.decrypt(&token, NOW_MS), Err(CryptoError::BadSignature));
    }

    #[test]
    fn token_layout_is_version_timestamp_iv() {
        let f = Fernet::new("cw_0x689RpI-jtRR7oE8h_eQsKImvJapLeSbXpwF4e4=").unwrap();
        let mut iv = [0u8; 16];
        for (i, b) in iv.iter_mut().enumerate() {
            *b = i as u8;
        }
        let token = f.encrypt_at(b"hello", 499_162_800, iv);
        assert!(token.starts_with("gAAAAAAdwJ6wAAECAwQFBgcICQoLDA0O"), "{}", token);
        assert_eq!(f.decrypt_string(&token, 499_162_800_000).unwrap(), "hello");
    }

    #[test]
    fn malformed_inputs() {
        assert_eq!(Fernet::new("short").unwrap_err(), CryptoError::InvalidKey);
        let f = Fernet::new(&Fernet::generate_key()).unwrap();
        assert_eq!(f.decrypt("!!!", NOW_MS), Err(CryptoError::InvalidToken));
        assert_eq!(f.decrypt("gAAA", NOW_MS), Err(CryptoError::InvalidToken));
    }
}
