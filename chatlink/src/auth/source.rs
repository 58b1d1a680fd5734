//! Built-in [`CredentialSource`]s.

use std::path::PathBuf;

use super::{Credential, CredentialError, CredentialSource, Identity};

/// Always answers with the same token.
#[derive(Debug, Clone)]
pub struct StaticCredentialSource {
    credential: Credential,
}

impl StaticCredentialSource {
    /// Serve `token` for every identity.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: Credential::new(token),
        }
    }
}

impl CredentialSource for StaticCredentialSource {
    async fn fetch(&self, _identity: &Identity) -> Result<Credential, CredentialError> {
        if self.credential.is_empty() {
            return Err(CredentialError::Empty);
        }
        Ok(self.credential.clone())
    }
}

/// Re-reads a token file on every fetch so another process can rotate it.
///
/// Surrounding whitespace is trimmed. An empty file is a failed fetch.
#[derive(Debug, Clone)]
pub struct FileCredentialSource {
    path: PathBuf,
}

impl FileCredentialSource {
    /// Read tokens from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialSource for FileCredentialSource {
    async fn fetch(&self, identity: &Identity) -> Result<Credential, CredentialError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let token = contents.trim();
        if token.is_empty() {
            return Err(CredentialError::Empty);
        }
        tracing::trace!(path = %self.path.display(), identity = %identity, "read credential file");
        Ok(Credential::new(token))
    }
}

/// Source chosen at startup from configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredSource {
    /// Fixed token.
    Static(StaticCredentialSource),
    /// Rotating token file.
    File(FileCredentialSource),
}

impl CredentialSource for ConfiguredSource {
    async fn fetch(&self, identity: &Identity) -> Result<Credential, CredentialError> {
        match self {
            Self::Static(source) => source.fetch(identity).await,
            Self::File(source) => source.fetch(identity).await,
        }
    }
}
