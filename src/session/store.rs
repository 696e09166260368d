//! Persistence of conversation state and skipped message keys.
//!
//! The codec reaches all conversation state through [`RatchetKeyStore`].
//! Message keys are addressed by [`MessageKeyId`], which names the
//! conversation, the sender ratchet key and the counter; conversation state by
//! [`ConversationId`].

use crate::session::{ConversationId, MessageKey, MessageKeyId, RatchetChainState};
use crate::utils::{CollaboratorError, Result};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Storage interface for ratchet state.
///
/// Implementations must tolerate lookups of counters in any order. Errors are
/// reported as [`CollaboratorError::KeyStore`] and passed through unmodified.
pub trait RatchetKeyStore: Send + Sync {
    /// Fetch a cached message key
    fn get(&self, id: &MessageKeyId) -> Result<Option<MessageKey>>;

    /// Cache a message key for a message not yet received
    fn put(&self, id: MessageKeyId, key: MessageKey) -> Result<()>;

    /// Cache several message keys at once.
    ///
    /// The default stores them one by one; persistent stores should override
    /// it with a single write.
    fn put_many(&self, keys: Vec<(MessageKeyId, MessageKey)>) -> Result<()> {
        for (id, key) in keys {
            self.put(id, key)?;
        }
        Ok(())
    }

    /// Remove a message key after use
    fn delete(&self, id: &MessageKeyId) -> Result<()>;

    /// Load the state of one conversation. Returns None if it was never saved.
    fn load_state(&self, conversation: &ConversationId) -> Result<Option<RatchetChainState>>;

    /// Store the state of one conversation
    fn save_state(&self, conversation: &ConversationId, state: &RatchetChainState) -> Result<()>;
}

impl<T: RatchetKeyStore + ?Sized> RatchetKeyStore for Arc<T> {
    fn get(&self, id: &MessageKeyId) -> Result<Option<MessageKey>> {
        (**self).get(id)
    }

    fn put(&self, id: MessageKeyId, key: MessageKey) -> Result<()> {
        (**self).put(id, key)
    }

    fn put_many(&self, keys: Vec<(MessageKeyId, MessageKey)>) -> Result<()> {
        (**self).put_many(keys)
    }

    fn delete(&self, id: &MessageKeyId) -> Result<()> {
        (**self).delete(id)
    }

    fn load_state(&self, conversation: &ConversationId) -> Result<Option<RatchetChainState>> {
        (**self).load_state(conversation)
    }

    fn save_state(&self, conversation: &ConversationId, state: &RatchetChainState) -> Result<()> {
        (**self).save_state(conversation, state)
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    message_keys: HashMap<MessageKeyId, MessageKey>,
    states: HashMap<ConversationId, RatchetChainState>,
}

/// In-memory key store, lost when the process exits
#[derive(Default)]
pub struct MemoryKeyStore {
    inner: RwLock<Snapshot>,
}

impl MemoryKeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached message keys
    pub fn message_key_count(&self) -> usize {
        self.inner.read().message_keys.len()
    }

    /// Number of persisted conversations
    pub fn state_count(&self) -> usize {
        self.inner.read().states.len()
    }
}

impl RatchetKeyStore for MemoryKeyStore {
    fn get(&self, id: &MessageKeyId) -> Result<Option<MessageKey>> {
        Ok(self.inner.read().message_keys.get(id).cloned())
    }

    fn put(&self, id: MessageKeyId, key: MessageKey) -> Result<()> {
        self.inner.write().message_keys.insert(id, key);
        Ok(())
    }

    fn put_many(&self, keys: Vec<(MessageKeyId, MessageKey)>) -> Result<()> {
        self.inner.write().message_keys.extend(keys);
        Ok(())
    }

    fn delete(&self, id: &MessageKeyId) -> Result<()> {
        self.inner.write().message_keys.remove(id);
        Ok(())
    }

    fn load_state(&self, conversation: &ConversationId) -> Result<Option<RatchetChainState>> {
        Ok(self.inner.read().states.get(conversation).cloned())
    }

    fn save_state(&self, conversation: &ConversationId, state: &RatchetChainState) -> Result<()> {
        self.inner.write().states.insert(*conversation, state.clone());
        Ok(())
    }
}

impl std::fmt::Debug for MemoryKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeyStore")
            .field("message_keys", &self.message_key_count())
            .field("conversations", &self.state_count())
            .finish()
    }
}

/// Key store persisted to a single bincode file.
///
/// Every mutation rewrites the file through a temporary file and a rename, so
/// the file on disk always holds a complete snapshot. A failed write leaves
/// both the file and the in-memory view unchanged.
pub struct FileKeyStore {
    path: PathBuf,
    inner: Mutex<Snapshot>,
}

impl FileKeyStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let snapshot = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|e| store_error("open", e))?;
            bincode::deserialize(&bytes).map_err(|e| store_error("open", e))?
        } else {
            Snapshot::default()
        };

        info!(
            "opened ratchet store {} ({} conversations, {} message keys)",
            path.display(),
            snapshot.states.len(),
            snapshot.message_keys.len()
        );

        Ok(Self {
            path,
            inner: Mutex::new(snapshot),
        })
    }

    /// Location of the store file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of cached message keys
    pub fn message_key_count(&self) -> usize {
        self.inner.lock().message_keys.len()
    }

    /// Number of persisted conversations
    pub fn state_count(&self) -> usize {
        self.inner.lock().states.len()
    }

    fn mutate<F>(&self, operation: &'static str, change: F) -> Result<()>
    where
        F: FnOnce(&mut Snapshot),
    {
        let mut current = self.inner.lock();
        let mut next = current.clone();
        change(&mut next);

        let bytes = bincode::serialize(&next).map_err(|e| store_error(operation, e))?;
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, bytes).map_err(|e| store_error(operation, e))?;
        std::fs::rename(&temp_path, &self.path).map_err(|e| store_error(operation, e))?;

        *current = next;
        debug!("ratchet store {} persisted after {}", self.path.display(), operation);
        Ok(())
    }
}

impl RatchetKeyStore for FileKeyStore {
    fn get(&self, id: &MessageKeyId) -> Result<Option<MessageKey>> {
        Ok(self.inner.lock().message_keys.get(id).cloned())
    }

    fn put(&self, id: MessageKeyId, key: MessageKey) -> Result<()> {
        self.mutate("put", |snapshot| {
            snapshot.message_keys.insert(id, key);
        })
    }

    fn put_many(&self, keys: Vec<(MessageKeyId, MessageKey)>) -> Result<()> {
        self.mutate("put_many", |snapshot| {
            snapshot.message_keys.extend(keys);
        })
    }

    fn delete(&self, id: &MessageKeyId) -> Result<()> {
        self.mutate("delete", |snapshot| {
            snapshot.message_keys.remove(id);
        })
    }

    fn load_state(&self, conversation: &ConversationId) -> Result<Option<RatchetChainState>> {
        Ok(self.inner.lock().states.get(conversation).cloned())
    }

    fn save_state(&self, conversation: &ConversationId, state: &RatchetChainState) -> Result<()> {
        self.mutate("save_state", |snapshot| {
            snapshot.states.insert(*conversation, state.clone());
        })
    }
}

impl std::fmt::Debug for FileKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKeyStore")
            .field("path", &self.path)
            .field("message_keys", &self.message_key_count())
            .finish()
    }
}

fn store_error<E>(operation: &'static str, source: E) -> crate::utils::SessionCoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    CollaboratorError::KeyStore {
        operation,
        source: Arc::new(source),
    }
    .into()
}
