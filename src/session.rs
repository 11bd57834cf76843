//! Mount session and per-worker cipher contexts
//!
//! The [`Session`] is built once at mount time after the content key has
//! been unwrapped and is then only read. Cipher contexts carry a moving
//! keystream position, so they live apart from it in [`CipherContexts`],
//! one per worker thread, created on first use.

use crate::crypto::{CipherContext, ContentKey};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::users::UserStore;
use dashmap::DashMap;
use rsa::RsaPrivateKey;
use std::path::{Path, PathBuf};
use std::thread::ThreadId;
use tracing::{debug, info};

/// Immutable state of one mounted root
#[derive(Debug)]
pub struct Session {
    root: PathBuf,
    user: String,
    content_key: ContentKey,
    block_size: usize,
}

impl Session {
    pub fn new<P: Into<PathBuf>>(
        root: P,
        user: &str,
        content_key: ContentKey,
        block_size: usize,
    ) -> Result<Self> {
        if block_size < crate::config::MIN_BLOCK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "block size {} is below the minimum of {}",
                block_size,
                crate::config::MIN_BLOCK_SIZE
            )));
        }

        Ok(Self {
            root: root.into(),
            user: user.to_string(),
            content_key,
            block_size,
        })
    }

    /// Authenticate `user` against an initialized root
    pub fn open<P: Into<PathBuf>>(root: P, user: &str, private_key: &RsaPrivateKey) -> Result<Self> {
        let store = UserStore::new(root);
        let block_size = store.config()?.block_size()?;
        let content_key = store.read_content_key(user, private_key)?;

        info!(
            "Session opened on {} for {} (block size {})",
            store.layout().root().display(),
            user,
            block_size
        );

        Self::new(store.layout().root(), user, content_key, block_size)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn content_key(&self) -> &ContentKey {
        &self.content_key
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.root)
    }
}

/// Registry of cipher contexts keyed by worker thread
pub struct CipherContexts {
    content_key: ContentKey,
    contexts: DashMap<ThreadId, CipherContext>,
}

impl CipherContexts {
    pub fn new(session: &Session) -> Self {
        Self {
            content_key: session.content_key().clone(),
            contexts: DashMap::new(),
        }
    }

    /// Run `f` with the calling thread's context
    pub fn with_context<R>(&self, f: impl FnOnce(&mut CipherContext) -> R) -> Result<R> {
        self.with_worker_context(std::thread::current().id(), f)
    }

    /// Run `f` with the context owned by `worker`, creating it if needed.
    ///
    /// The context is checked out of the map while `f` runs, so no map
    /// lock is held across block I/O.
    pub fn with_worker_context<R>(
        &self,
        worker: ThreadId,
        f: impl FnOnce(&mut CipherContext) -> R,
    ) -> Result<R> {
        let mut context = match self.contexts.remove(&worker) {
            Some((_, context)) => context,
            None => {
                debug!("Creating cipher context for {:?}", worker);
                CipherContext::new(self.content_key.as_bytes())?
            }
        };

        let result = f(&mut context);
        self.contexts.insert(worker, context);
        Ok(result)
    }

    /// Drop the context of a worker that has finished
    pub fn release(&self, worker: ThreadId) -> bool {
        self.contexts.remove(&worker).is_some()
    }

    /// Drop every context at the end of the session
    pub fn clear(&self) {
        self.contexts.clear();
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl std::fmt::Debug for CipherContexts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherContexts")
            .field("workers", &self.contexts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keywrap::test_keys::{private_key, public_key};
    use crate::crypto::CONTENT_KEY_SIZE;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn session() -> Session {
        let key = ContentKey::from_slice(&[5u8; CONTENT_KEY_SIZE]).unwrap();
        Session::new("/tmp/root", "alice", key, 16).unwrap()
    }

    #[test]
    fn test_open_session() {
        let dir = tempdir().unwrap();
        let store = UserStore::new(dir.path());
        store.init("alice", &public_key(0), Some(32)).unwrap();

        let session = Session::open(dir.path(), "alice", private_key(0)).unwrap();
        assert_eq!(session.block_size(), 32);
        assert_eq!(session.user(), "alice");
        assert_eq!(session.root(), dir.path());

        assert!(matches!(
            Session::open(dir.path(), "alice", private_key(1)),
            Err(Error::DecryptFailure(_))
        ));
        assert!(matches!(
            Session::open(dir.path(), "bob", private_key(0)),
            Err(Error::UserNotFound(_))
        ));
    }

    #[test]
    fn test_open_without_config() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Session::open(dir.path(), "alice", private_key(0)),
            Err(Error::ConfigMissingOrMalformed(_))
        ));
    }

    #[test]
    fn test_block_size_minimum() {
        let key = ContentKey::from_slice(&[5u8; CONTENT_KEY_SIZE]).unwrap();
        assert!(matches!(
            Session::new("/tmp/root", "alice", key, 7),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_context_created_lazily_and_reused() {
        let contexts = CipherContexts::new(&session());
        assert!(contexts.is_empty());

        let first = contexts.with_context(|ctx| ctx.encrypt(0, b"data")).unwrap();
        assert_eq!(contexts.len(), 1);

        let second = contexts.with_context(|ctx| ctx.encrypt(0, b"data")).unwrap();
        assert_eq!(contexts.len(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn test_one_context_per_thread() {
        let contexts = Arc::new(CipherContexts::new(&session()));
        let expected = contexts
            .with_context(|ctx| ctx.encrypt(32, b"shared plaintext"))
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let contexts = Arc::clone(&contexts);
                std::thread::spawn(move || {
                    let mut outputs = Vec::new();
                    for _ in 0..50 {
                        let out = contexts
                            .with_context(|ctx| ctx.encrypt(32, b"shared plaintext"))
                            .unwrap();
                        outputs.push(out);
                    }
                    (std::thread::current().id(), outputs)
                })
            })
            .collect();

        let mut workers = Vec::new();
        for handle in handles {
            let (id, outputs) = handle.join().unwrap();
            assert!(outputs.iter().all(|out| *out == expected));
            workers.push(id);
        }

        assert_eq!(contexts.len(), 5);
        assert!(contexts.release(workers[0]));
        assert!(!contexts.release(workers[0]));
        assert_eq!(contexts.len(), 4);

        contexts.clear();
        assert!(contexts.is_empty());
    }

    #[test]
    fn test_explicit_worker_identity() {
        let contexts = CipherContexts::new(&session());
        let worker = std::thread::spawn(|| std::thread::current().id())
            .join()
            .unwrap();

        let ciphertext = contexts
            .with_worker_context(worker, |ctx| ctx.encrypt(0, b"block"))
            .unwrap();
        let plaintext = contexts
            .with_context(|ctx| ctx.decrypt(0, &ciphertext))
            .unwrap();

        assert_eq!(plaintext, b"block");
        assert_eq!(contexts.len(), 2);
    }
}
