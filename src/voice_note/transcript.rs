use crate::crypto::WrappedClientKey;
use serde::{Deserialize, Serialize};

pub use crate::chat::state::{TranscriptApi as Transcript, TranscriptPhraseApi as TranscriptPhrase};

/// Response of `show_transcript`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedTranscript {
    pub encrypted_transcript: String,
}

/// Decrypts and parses a transcript. `server_now_ms` bounds the token's
/// freshness check.
pub fn decrypt_transcript(key: &WrappedClientKey, token: &str, server_now_ms: i64) -> Result<Transcript, String> {
    let plain = key
        .key
        .decrypt(token, server_now_ms)
        .map_err(|e| format!("Failed to decrypt transcript: {}", e))?;
    serde_json::from_slice(&plain).map_err(|e| format!("Failed to parse transcript: {}", e))
}

/// Decrypts the binned intensity data `show_audio` returns.
pub fn decrypt_intensity(key: &WrappedClientKey, token: &str, server_now_ms: i64) -> Result<Vec<Vec<f32>>, String> {
    let plain = key
        .key
        .decrypt(token, server_now_ms)
        .map_err(|e| format!("Failed to decrypt audio: {}", e))?;
    let mut tvi: Vec<Vec<f32>> =
        serde_json::from_slice(&plain).map_err(|e| format!("Failed to parse audio: {}", e))?;
    super::analysis::floor_intensity(&mut tvi);
    Ok(tvi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Fernet;

    const NOW: i64 = 1_700_000_000_000;

    fn key() -> WrappedClientKey {
        WrappedClientKey {
            uid: "ck".into(),
            key: Fernet::new(&Fernet::generate_key()).unwrap(),
        }
    }

    #[test]
    fn transcript_decrypts() {
        let key = key();
        let token = key.key.encrypt(
            br#"{"uid":"t1","phrases":[{"starts_at":0.0,"ends_at":1.5,"phrase":"hello there"}]}"#,
            NOW,
        );
        let t = decrypt_transcript(&key, &token, NOW).unwrap();
        assert_eq!(t.uid, "t1");
        assert_eq!(t.phrases[0].phrase, "hello there");
    }

    #[test]
    fn transcript_from_another_key_fails() {
        let token = key().key.encrypt(br#"{"uid":"t1","phrases":[]}"#, NOW);
        let err = decrypt_transcript(&key(), &token, NOW).unwrap_err();
        assert!(err.starts_with("Failed to decrypt transcript"));
    }

    #[test]
    fn intensity_is_floored() {
        let key = key();
        let token = key.key.encrypt(b"[[0.0,0.7],[0.01]]", NOW);
        assert_eq!(decrypt_intensity(&key, &token, NOW).unwrap(), vec![vec![0.02, 0.7], vec![0.02]]);
    }
}
