use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use vudash_core::token::{STILL_RUNNING, Token};

use crate::error::{Error, Result};

/// File-backed registry of dashboard tokens.
///
/// The file is read once at open; afterwards the in-memory list is the
/// source of truth and every mutation writes the full list back. Mutations
/// either fully apply or leave the stored list untouched.
pub struct TokenRegistry {
    path: PathBuf,
    ephemeral: bool,
    tokens: RwLock<Vec<Token>>,
}

impl TokenRegistry {
    /// Opens (or creates) the registry file. A missing or corrupt file
    /// starts the registry empty rather than failing.
    pub fn open(path: impl Into<PathBuf>, ephemeral: bool) -> Result<Self> {
        let path = path.into();
        let tokens = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<Token>>(&bytes) {
                Ok(list) => list,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "corrupt token registry, starting empty");
                    Vec::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let registry = Self {
            path,
            ephemeral,
            tokens: RwLock::new(tokens),
        };
        registry.persist(&registry.read_guarded())?;
        Ok(registry)
    }

    pub fn list(&self) -> Vec<Token> {
        self.read_guarded()
    }

    pub fn get(&self, id: &str) -> Option<Token> {
        self.read_guarded().into_iter().find(|t| t.id == id)
    }

    /// Registers a new token. The server owns `end_at`: whatever the caller
    /// sent is overwritten with the still-running sentinel.
    pub fn create(&self, mut token: Token) -> Result<Token> {
        if token.title.trim().is_empty() {
            return Err(Error::Validation("title is required".to_string()));
        }
        if token.id.trim().is_empty() {
            return Err(Error::Validation("id is required".to_string()));
        }
        token.end_at = STILL_RUNNING.to_string();

        let mut guard = self
            .tokens
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.iter().any(|t| t.id == token.id) {
            return Err(Error::Conflict(token.id));
        }

        guard.push(token.clone());
        if let Err(err) = self.persist(&guard) {
            guard.pop();
            return Err(err);
        }
        Ok(token)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut guard = self
            .tokens
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(pos) = guard.iter().position(|t| t.id == id) else {
            return Err(Error::NotFound(id.to_string()));
        };

        let removed = guard.remove(pos);
        if let Err(err) = self.persist(&guard) {
            guard.insert(pos, removed);
            return Err(err);
        }
        Ok(())
    }

    /// Writes the stop time onto a token, once. Returns `false` (without
    /// touching anything) when the token already carries one.
    pub fn set_end_at(&self, id: &str, end_at: &str) -> Result<bool> {
        let mut guard = self
            .tokens
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(token) = guard.iter_mut().find(|t| t.id == id) else {
            return Err(Error::NotFound(id.to_string()));
        };
        if token.end_at != STILL_RUNNING {
            return Ok(false);
        }

        let previous = std::mem::replace(&mut token.end_at, end_at.to_string());
        if let Err(err) = self.persist(&guard) {
            if let Some(token) = guard.iter_mut().find(|t| t.id == id) {
                token.end_at = previous;
            }
            return Err(err);
        }
        Ok(true)
    }

    /// Flushes, and in ephemeral mode resets the file to an empty list.
    /// Called once from the process shutdown hook.
    pub fn close(&self) -> Result<()> {
        if self.ephemeral {
            tracing::info!(path = %self.path.display(), "resetting token registry on shutdown");
            fs::write(&self.path, b"[]")?;
            return Ok(());
        }
        self.persist(&self.read_guarded())
    }

    fn read_guarded(&self) -> Vec<Token> {
        let guard = self
            .tokens
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }

    fn persist(&self, tokens: &[Token]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(tokens)?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}
