use std::{
    fs,
    path::PathBuf,
    sync::Mutex,
};

use tracing::warn;

/// Scoped storage for the bearer token the REST layer and the duplex channel
/// present to the server. Swappable so a host can pick session-lived or
/// persistent credentials without the client caring.
pub trait TokenStore: Send + Sync {
    fn token(&self) -> Option<String>;
    fn store(&self, token: &str);
    fn clear(&self);
}

/// Session-lived token storage. Gone when the process exits.
#[derive(Default)]
pub struct SessionTokenStore {
    token: Mutex<Option<String>>,
}

impl TokenStore for SessionTokenStore {
    fn token(&self) -> Option<String> {
        self.token.lock().expect("token lock").clone()
    }

    fn store(&self, token: &str) {
        *self.token.lock().expect("token lock") = Some(token.to_string());
    }

    fn clear(&self) {
        *self.token.lock().expect("token lock") = None;
    }
}

/// File-backed token storage for "stay signed in" setups.
pub struct PersistentTokenStore {
    path: PathBuf,
}

impl PersistentTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStore for PersistentTokenStore {
    fn token(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                let token = raw.trim();
                if token.is_empty() {
                    None
                } else {
                    Some(token.to_string())
                }
            }
            Err(_) => None,
        }
    }

    fn store(&self, token: &str) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(err) = fs::write(&self.path, token) {
            warn!(path = %self.path.display(), "auth: failed to persist token: {err}");
        }
    }

    fn clear(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "auth: failed to remove token file: {err}");
            }
        }
    }
}
