use keyring::Entry;
use thiserror::Error;
use tokio::sync::watch;

const SERVICE_NAME: &str = "inbox-agent";
const TOKEN_KEY: &str = "auth-token";
const USER_ID_KEY: &str = "user-id";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("token not found")]
    TokenNotFound,
}

/// Keyring-backed credential storage. Login and logout happen in the UI;
/// the pipeline only ever reads the current token, freshly, per attempt.
/// `subscribe` hands out a change signal so the worker can resume the
/// moment a new token lands (or pause on logout).
pub struct CredentialStore {
    token_entry: Entry,
    user_entry: Entry,
    changed: watch::Sender<u64>,
}

impl CredentialStore {
    pub fn new() -> Result<Self, CredentialError> {
        let (changed, _) = watch::channel(0);
        Ok(Self {
            token_entry: Entry::new(SERVICE_NAME, TOKEN_KEY)?,
            user_entry: Entry::new(SERVICE_NAME, USER_ID_KEY)?,
            changed,
        })
    }

    pub fn save_session(&self, token: &str, user_id: &str) -> Result<(), CredentialError> {
        self.token_entry.set_password(token)?;
        self.user_entry.set_password(user_id)?;
        self.notify_changed();
        Ok(())
    }

    pub fn get_token(&self) -> Result<String, CredentialError> {
        match self.token_entry.get_password() {
            Ok(token) => Ok(token),
            Err(keyring::Error::NoEntry) => Err(CredentialError::TokenNotFound),
            Err(err) => Err(CredentialError::Keyring(err)),
        }
    }

    /// The worker's view: a valid-looking token or nothing.
    pub fn current_token(&self) -> Option<String> {
        self.token_entry.get_password().ok()
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.user_entry.get_password().ok()
    }

    pub fn has_token(&self) -> bool {
        self.token_entry.get_password().is_ok()
    }

    pub fn clear(&self) -> Result<(), CredentialError> {
        for entry in [&self.token_entry, &self.user_entry] {
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(err) => return Err(CredentialError::Keyring(err)),
            }
        }
        self.notify_changed();
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn notify_changed(&self) {
        self.changed.send_modify(|version| *version += 1);
    }
}
