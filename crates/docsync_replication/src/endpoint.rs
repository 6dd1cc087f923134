//! Remote endpoint descriptors.

use crate::error::{SyncError, SyncResult};
use crate::job::Direction;
use std::fmt;
use std::path::PathBuf;

/// Locator schemes an endpoint may use.
pub const SUPPORTED_SCHEMES: [&str; 4] = ["http", "https", "memory", "file"];

/// A key/secret pair presented to the remote.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account key or user name.
    pub key: String,
    /// Secret or password.
    pub secret: String,
}

impl Credentials {
    /// Creates a credential pair.
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Where replication goes: a remote locator, a database on it, and the
/// credentials to use.
///
/// An endpoint is immutable once built. It is checked by
/// [`Endpoint::validate`], which every job runs before it starts.
///
/// ```rust
/// use docsync_replication::Endpoint;
///
/// let endpoint = Endpoint::new("https://db.example.com", "crossdevice")
///     .with_credentials("key", "secret");
/// assert!(endpoint.validate().is_ok());
///
/// let anonymous = Endpoint::new("https://db.example.com", "crossdevice");
/// assert!(anonymous.validate().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    locator: String,
    database: String,
    credentials: Option<Credentials>,
}

impl Endpoint {
    /// Creates an endpoint without credentials.
    pub fn new(locator: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            database: database.into(),
            credentials: None,
        }
    }

    /// Attaches credentials.
    #[must_use]
    pub fn with_credentials(mut self, key: impl Into<String>, secret: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(key, secret));
        self
    }

    /// Returns the locator, e.g. `https://host` or `file:///var/lib/remote`.
    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Returns the remote database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Returns the credentials, if any.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Returns the locator scheme, if the locator has one.
    pub fn scheme(&self) -> Option<&str> {
        self.locator.split_once("://").map(|(scheme, _)| scheme)
    }

    /// Returns the directory of a `file://` locator.
    pub fn file_root(&self) -> Option<PathBuf> {
        self.locator
            .strip_prefix("file://")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }

    /// Name of the local checkpoint tracking this endpoint in `direction`.
    pub fn checkpoint_key(&self, direction: Direction) -> String {
        format!(
            "{direction}:{}/{}",
            self.locator.trim_end_matches('/'),
            self.database
        )
    }

    /// Checks the endpoint is usable.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Configuration`] if:
    /// - the locator is not `scheme://...` with a supported scheme
    /// - an `http(s)` locator has no host or no credentials
    /// - credentials are present with an empty key or secret
    /// - the database name is not a valid name (starts with a lowercase
    ///   letter, then lowercase letters, digits or `_ $ ( ) + - /`)
    pub fn validate(&self) -> SyncResult<()> {
        let (scheme, rest) = self.locator.split_once("://").ok_or_else(|| {
            SyncError::configuration(format!(
                "locator {:?} must have the form scheme://address",
                self.locator
            ))
        })?;

        if !SUPPORTED_SCHEMES.contains(&scheme) {
            return Err(SyncError::configuration(format!(
                "unsupported locator scheme {scheme:?} (expected one of {})",
                SUPPORTED_SCHEMES.join(", ")
            )));
        }

        match scheme {
            "http" | "https" => {
                let host = rest.split('/').next().unwrap_or_default();
                if host.is_empty() {
                    return Err(SyncError::configuration(format!(
                        "locator {:?} has no host",
                        self.locator
                    )));
                }
                if self.credentials.is_none() {
                    return Err(SyncError::configuration(
                        "credentials are required for http(s) endpoints",
                    ));
                }
            }
            "file" if rest.is_empty() => {
                return Err(SyncError::configuration("file locator has no path"));
            }
            _ => {}
        }

        if let Some(credentials) = &self.credentials {
            if credentials.key.is_empty() || credentials.secret.is_empty() {
                return Err(SyncError::configuration(
                    "credential key and secret must not be empty",
                ));
            }
        }

        validate_database_name(&self.database)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.locator.trim_end_matches('/'), self.database)
    }
}

fn validate_database_name(name: &str) -> SyncResult<()> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let valid_rest = chars.all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || "_$()+-/".contains(c)
    });

    if valid_start && valid_rest {
        Ok(())
    } else {
        Err(SyncError::configuration(format!(
            "invalid database name {name:?}"
        )))
    }
}
