use std::collections::HashSet;

use rand::Rng;
use tokio::sync::Mutex;

/// Default number of characters in a minted lock id.
pub const LOCK_ID_LEN: usize = 5;

const LOCK_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// The set of lock ids currently held by some entry.
///
/// Minting consults this set so that no two simultaneously-held locks ever
/// share an id. Ids join the set when a lock write succeeds and leave it
/// when the entry unlocks or is deleted.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    ids: Mutex<HashSet<String>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.ids.lock().await.contains(id)
    }

    /// Returns false if the id was already registered.
    pub async fn add(&self, id: &str) -> bool {
        self.ids.lock().await.insert(id.to_owned())
    }

    /// Returns false if the id was not registered.
    pub async fn remove(&self, id: &str) -> bool {
        self.ids.lock().await.remove(id)
    }

    /// Mints a fresh opaque lock id of `len` characters, regenerating until
    /// it collides with no currently live id.
    pub async fn mint(&self, len: usize) -> String {
        let mut id = random_id(len);
        while self.exists(&id).await {
            debug!(id = %id, "lock id collision, minting another");
            id = random_id(len);
        }
        id
    }
}

fn random_id(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..LOCK_ID_ALPHABET.len());
            LOCK_ID_ALPHABET[idx] as char
        })
        .collect()
}
