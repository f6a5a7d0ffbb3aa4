//! Journal client keys: a Fernet key agreed with the server through a
//! Diffie-Hellman exchange over the 2048-bit MODP group (RFC 3526, group 14),
//! cached on disk per user.

use super::fernet::{Fernet, URL_SAFE_LENIENT};
use super::CryptoError;
use crate::api::{ApiClient, User};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use num_bigint::BigUint;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const GROUP_14_PRIME: &[u8] = b"32317006071311007300338913926423828248817941241140239112842009751400741706634354222619689417363569347117901737909704191754605873209195028853758986185622153212175412514901774520270235796078236248884246189477587641105928646099411723245426622522193230540919037680524235519125679715870117001058055877651038861847280257976054903569732561526167081339361799541336476559160368317896729073178384589680639671900977202194168647225871031411336429319536193471636533209717077448227988588565369208645296636077250268955505928362751121174096972998068410554359584866583291642136218231078990999448652468262416972035911852507045361090559";
const GROUP_14_GENERATOR: u32 = 2;
const GROUP_BYTES: usize = 256;
const KEY_FILE: &str = "journal_client_key.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientKey {
    pub uid: String,
    /// base64url Fernet key
    pub key: String,
}

/// A client key ready for use.
#[derive(Debug, Clone)]
pub struct WrappedClientKey {
    pub uid: String,
    pub key: Fernet,
}

impl WrappedClientKey {
    pub fn wrap(raw: &ClientKey) -> Result<Self, CryptoError> {
        Ok(Self {
            uid: raw.uid.clone(),
            key: Fernet::new(&raw.key)?,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct StoredClientKey {
    user: String,
    key: ClientKey,
}

#[derive(Deserialize)]
struct KeyExchangeResponse {
    uid: String,
    server_dh_public_key: String,
    salt: String,
    #[serde(default)]
    visitor: Option<String>,
}

fn group_prime() -> Result<BigUint, CryptoError> {
    BigUint::parse_bytes(GROUP_14_PRIME, 10)
        .ok_or_else(|| CryptoError::KeyExchange("invalid group prime".into()))
}

fn to_group_bytes(n: &BigUint) -> [u8; GROUP_BYTES] {
    let raw = n.to_bytes_be();
    let mut out = [0u8; GROUP_BYTES];
    let start = GROUP_BYTES.saturating_sub(raw.len());
    let skip = raw.len().saturating_sub(GROUP_BYTES);
    out[start..].copy_from_slice(&raw[skip..]);
    out
}

pub fn generate_private_key() -> [u8; GROUP_BYTES] {
    let mut private = [0u8; GROUP_BYTES];
    rand::thread_rng().fill_bytes(&mut private);
    private
}

/// `g^private mod p`, big-endian and left padded to the group size.
pub fn public_key(private: &[u8]) -> Result<[u8; GROUP_BYTES], CryptoError> {
    let p = group_prime()?;
    let x = BigUint::from_bytes_be(private);
    Ok(to_group_bytes(&BigUint::from(GROUP_14_GENERATOR).modpow(&x, &p)))
}

/// Shared secret run through HKDF-SHA256 (salted, empty info) into a Fernet key.
pub fn derive_fernet_key(private: &[u8], peer_public: &[u8], salt: &[u8]) -> Result<String, CryptoError> {
    let p = group_prime()?;
    let peer = BigUint::from_bytes_be(peer_public);
    if peer <= BigUint::from(1u32) || peer >= p {
        return Err(CryptoError::KeyExchange("peer public key out of range".into()));
    }
    let shared = to_group_bytes(&peer.modpow(&BigUint::from_bytes_be(private), &p));
    let hk = Hkdf::<Sha256>::new(Some(salt), &shared);
    let mut okm = [0u8; 32];
    hk.expand(&[], &mut okm)
        .map_err(|_| CryptoError::KeyExchange("hkdf expand".into()))?;
    Ok(URL_SAFE_LENIENT.encode(okm))
}

/// Reads, creates and deletes the stored client key. Every operation holds
/// the store's lock so concurrent callers never race a create against a
/// delete or mint two keys at once.
pub struct ClientKeyStore {
    path: PathBuf,
    api: Arc<ApiClient>,
    lock: Mutex<()>,
}

impl ClientKeyStore {
    pub fn new(path: PathBuf, api: Arc<ApiClient>) -> Self {
        Self {
            path,
            api,
            lock: Mutex::new(()),
        }
    }

    pub fn in_data_dir(api: Arc<ApiClient>) -> Result<Self, String> {
        Ok(Self::new(crate::settings::data_dir()?.join(KEY_FILE), api))
    }

    pub async fn get_or_create(&self, user: &User) -> Result<ClientKey, CryptoError> {
        let _guard = self.lock.lock().await;
        if let Some(existing) = self.read(user).await {
            return Ok(existing);
        }
        let created = self.exchange(user).await?;
        self.write(user, &created).await?;
        log::info!("[keys] created journal client key {}", created.uid);
        Ok(created)
    }

    pub async fn get_or_create_wrapped(&self, user: &User) -> Result<WrappedClientKey, CryptoError> {
        WrappedClientKey::wrap(&self.get_or_create(user).await?)
    }

    /// Removes the stored key only if it has the given uid.
    pub async fn delete(&self, uid: &str) -> Result<(), CryptoError> {
        let _guard = self.lock.lock().await;
        let Some(stored) = self.read_raw().await else {
            return Ok(());
        };
        if stored.key.uid != uid {
            return Ok(());
        }
        self.remove().await
    }

    /// Removes any stored key regardless of owner.
    pub async fn purge(&self) -> Result<(), CryptoError> {
        let _guard = self.lock.lock().await;
        self.remove().await
    }

    async fn read_raw(&self) -> Option<StoredClientKey> {
        let text = tokio::fs::read_to_string(&self.path).await.ok()?;
        serde_json::from_str(&text).ok()
    }

    async fn read(&self, user: &User) -> Option<ClientKey> {
        let stored = self.read_raw().await?;
        if stored.user != user.sub {
            log::info!("[keys] stored client key belongs to another user; discarding");
            if let Err(e) = self.remove().await {
                log::warn!("[keys] failed to discard another user's client key: {}", e);
            }
            return None;
        }
        Some(stored.key)
    }

    async fn write(&self, user: &User, key: &ClientKey) -> Result<(), CryptoError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CryptoError::Storage(format!("Failed to create key dir: {}", e)))?;
        }
        let json = serde_json::to_string(&StoredClientKey {
            user: user.sub.clone(),
            key: key.clone(),
        })
        .map_err(|e| CryptoError::Storage(format!("Failed to serialize key: {}", e)))?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|e| CryptoError::Storage(format!("Failed to write key: {}", e)))
    }

    async fn remove(&self) -> Result<(), CryptoError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CryptoError::Storage(format!("Failed to remove key: {}", e))),
        }
    }

    async fn exchange(&self, user: &User) -> Result<ClientKey, CryptoError> {
        let private = generate_private_key();
        let public = public_key(&private)?;
        let body = serde_json::json!({
            "platform": self.api.platform(),
            "client_dh_public_key": BASE64.encode(public),
        });
        let resp: KeyExchangeResponse = self
            .api
            .post_json("/api/1/journals/client_keys/", &body, Some(&user.id_token))
            .await
            .map_err(|e| CryptoError::KeyExchange(e.to_string()))?;
        if let Some(visitor) = resp.visitor.as_deref() {
            self.api.set_visitor(visitor);
        }
        let server_public = BASE64
            .decode(&resp.server_dh_public_key)
            .map_err(|_| CryptoError::KeyExchange("server public key is not base64".into()))?;
        let salt = BASE64
            .decode(&resp.salt)
            .map_err(|_| CryptoError::KeyExchange("salt is not base64".into()))?;
        Ok(ClientKey {
            uid: resp.uid,
            key: derive_fernet_key(&private, &server_public, &salt)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ServerClock;

    fn user(sub: &str) -> User {
        User {
            sub: sub.into(),
            id_token: "token".into(),
        }
    }

    fn store(name: &str) -> ClientKeyStore {
        let dir = std::env::temp_dir().join(format!("voicejournal-keys-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let api = Arc::new(ApiClient::new("http://127.0.0.1:9", "test", Arc::new(ServerClock::new())));
        ClientKeyStore::new(dir.join(KEY_FILE), api)
    }

    #[test]
    fn both_sides_derive_the_same_key() {
        let client = generate_private_key();
        let server = generate_private_key();
        let salt = b"0123456789abcdef";
        let a = derive_fernet_key(&client, &public_key(&server).unwrap(), salt).unwrap();
        let b = derive_fernet_key(&server, &public_key(&client).unwrap(), salt).unwrap();
        assert_eq!(a, b);
        let fernet = Fernet::new(&a).unwrap();
        let token = fernet.encrypt(b"ok", 0);
        assert_eq!(Fernet::new(&b).unwrap().decrypt(&token, 0).unwrap(), b"ok");
    }

    #[test]
    fn degenerate_peer_key_is_rejected() {
        let private = generate_private_key();
        assert!(derive_fernet_key(&private, &[1], b"salt").is_err());
    }

    #[tokio::test]
    async fn stored_key_is_reused_for_same_user() {
        let store = store("reuse");
        let key = ClientKey {
            uid: "ck-1".into(),
            key: Fernet::generate_key(),
        };
        store.write(&user("alice"), &key).await.unwrap();
        assert_eq!(store.get_or_create(&user("alice")).await.unwrap(), key);
        assert!(store.get_or_create_wrapped(&user("alice")).await.is_ok());
    }

    #[tokio::test]
    async fn other_users_key_is_discarded() {
        let store = store("other");
        let key = ClientKey {
            uid: "ck-1".into(),
            key: Fernet::generate_key(),
        };
        store.write(&user("alice"), &key).await.unwrap();
        assert_eq!(store.read(&user("bob")).await, None);
        assert!(store.read_raw().await.is_none());
    }

    #[tokio::test]
    async fn delete_only_matching_uid() {
        let store = store("delete");
        let key = ClientKey {
            uid: "ck-1".into(),
            key: Fernet::generate_key(),
        };
        store.write(&user("alice"), &key).await.unwrap();
        store.delete("ck-2").await.unwrap();
        assert!(store.read_raw().await.is_some());
        store.delete("ck-1").await.unwrap();
        assert!(store.read_raw().await.is_none());
        store.purge().await.unwrap();
    }

    #[tokio::test]
    async fn remove_tolerates_missing_file_but_reports_other_failures() {
        let store = store("remove");
        store.remove().await.unwrap();

        let dir = std::env::temp_dir().join(format!("voicejournal-keys-blocked-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let not_a_dir = dir.join("plain-file");
        std::fs::write(&not_a_dir, b"x").unwrap();
        let api = Arc::new(ApiClient::new("http://127.0.0.1:9", "test", Arc::new(ServerClock::new())));
        let blocked = ClientKeyStore::new(not_a_dir.join(KEY_FILE), api);
        assert!(matches!(blocked.remove().await, Err(CryptoError::Storage(_))));
        assert_eq!(blocked.read(&user("bob")).await, None);
    }
}
