use crate::models::{AuthState, Credential, compact_id};
use crate::relay::TokenGrant;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential storage failed: {0}")]
    Io(#[from] io::Error),
    #[error("credential file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Notion is not linked.")]
    NotLinked,
    #[error("Notion revoke failed; staying logged in: {0}")]
    RevokeFailed(#[source] AuthorityError),
}

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("authority unreachable: {0}")]
    Transport(String),
    #[error("authority rejected the request: HTTP {0}")]
    Status(u16),
    #[error("authority response malformed: {0}")]
    Malformed(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Introspection {
    pub active: bool,
}

/// Remote OAuth authority: introspection and revocation.
pub trait Authority: Send + Sync {
    fn introspect(&self, access_token: &str) -> Result<Introspection, AuthorityError>;
    fn revoke(&self, access_token: &str) -> Result<(), AuthorityError>;
}

/// Local secure storage for the credential.
pub trait CredentialStore: Send {
    fn load(&self) -> Result<Option<Credential>, CredentialError>;
    fn save(&self, credential: &Credential) -> Result<(), CredentialError>;
    fn clear(&self) -> Result<(), CredentialError>;
}

pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credential>, CredentialError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        let credential: Credential = serde_json::from_str(&content)?;
        Ok(Some(credential))
    }

    fn save(&self, credential: &Credential) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(credential)?;
        fs::write(&self.path, content)?;
        restrict_permissions(&self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), CredentialError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LoadOutcome {
    Absent,
    Valid(Credential),
    Invalid(Credential),
}

impl LoadOutcome {
    /// Auth state a freshly started process should assume.
    pub fn auth_state(&self) -> AuthState {
        match self {
            LoadOutcome::Absent => AuthState::NotStarted,
            LoadOutcome::Valid(_) => AuthState::Success,
            LoadOutcome::Invalid(_) => AuthState::Failed,
        }
    }
}

impl Credential {
    pub fn from_grant(grant: TokenGrant) -> Self {
        let owner = grant.owner.user;
        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            token_type: grant.token_type,
            bot_id: grant.bot_id,
            workspace_id: grant
                .workspace_id
                .as_deref()
                .map(compact_id)
                .unwrap_or_default(),
            workspace_name: grant.workspace_name,
            workspace_icon: grant.workspace_icon,
            database_id: grant
                .duplicated_template_id
                .as_deref()
                .map(compact_id)
                .filter(|id| !id.is_empty()),
            owner,
            request_id: grant.request_id,
        }
    }
}

/// Validates, persists and revokes the single process-wide credential.
pub struct CredentialGuard {
    store: Box<dyn CredentialStore>,
    authority: Arc<dyn Authority>,
    current: Option<Credential>,
}

impl CredentialGuard {
    pub fn new(store: Box<dyn CredentialStore>, authority: Arc<dyn Authority>) -> Self {
        Self {
            store,
            authority,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&Credential> {
        self.current.as_ref()
    }

    /// Classifies only; never mutates the credential.
    pub fn validate(&self, credential: &Credential) -> Validity {
        match self.authority.introspect(&credential.access_token) {
            Ok(Introspection { active: true }) => Validity::Valid,
            Ok(Introspection { active: false }) => {
                info!("token introspection reports inactive token");
                Validity::Invalid
            }
            Err(err) => {
                warn!("token introspection failed: {err}");
                Validity::Invalid
            }
        }
    }

    pub fn load(&mut self) -> LoadOutcome {
        let stored = match self.store.load() {
            Ok(stored) => stored,
            Err(err) => {
                warn!("ignoring unreadable credential: {err}");
                None
            }
        };
        let Some(credential) = stored else {
            self.current = None;
            return LoadOutcome::Absent;
        };
        debug!(workspace = ?credential.workspace_name, "loaded stored credential");
        self.current = Some(credential.clone());
        match self.validate(&credential) {
            Validity::Valid => LoadOutcome::Valid(credential),
            Validity::Invalid => LoadOutcome::Invalid(credential),
        }
    }

    pub fn persist(&mut self, credential: Credential) -> Result<(), CredentialError> {
        self.store.save(&credential)?;
        info!(user = ?credential.owner_name(), "credential saved");
        self.current = Some(credential);
        Ok(())
    }

    /// Local state is cleared only after the authority acknowledges the revoke.
    pub fn revoke_and_clear(&mut self) -> Result<(), CredentialError> {
        let Some(credential) = self.current.as_ref() else {
            return Err(CredentialError::NotLinked);
        };
        self.authority
            .revoke(&credential.access_token)
            .map_err(CredentialError::RevokeFailed)?;
        self.store.clear()?;
        self.current = None;
        info!("credential revoked and cleared");
        Ok(())
    }

    pub fn select_database(&mut self, database_id: &str) -> Result<(), CredentialError> {
        let Some(mut credential) = self.current.clone() else {
            return Err(CredentialError::NotLinked);
        };
        let id = compact_id(database_id);
        credential.database_id = (!id.is_empty()).then_some(id);
        self.persist(credential)
    }
}
