//! Password lookup in an OS credential store.
//!
//! Secrets are filed under the attributes `connection` (`host:port`, optional) and
//! `username`. The D-Bus secret service backend is behind the `secret-service` feature.

use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::sync::Mutex;

pub const ATTR_CONNECTION: &str = "connection";
pub const ATTR_USERNAME: &str = "username";
pub const ATTR_APPLICATION: &str = "application";
pub const APPLICATION: &str = "exasol-provider";

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Paths of all stored items matching `connection` and `username`.
    async fn search(&self, connection: Option<&str>, username: &str) -> ProviderResult<Vec<String>>;

    /// The first matching password, if any.
    async fn lookup(&self, connection: Option<&str>, username: &str)
    -> ProviderResult<Option<String>>;

    /// Store a password, replacing an item with the same attributes.
    async fn set(&self, connection: Option<&str>, username: &str, password: &str)
    -> ProviderResult<()>;
}

fn attributes<'a>(connection: Option<&'a str>, username: &'a str) -> HashMap<&'a str, &'a str> {
    let mut attrs = HashMap::from([(ATTR_APPLICATION, APPLICATION), (ATTR_USERNAME, username)]);
    if let Some(connection) = connection {
        attrs.insert(ATTR_CONNECTION, connection);
    }
    attrs
}

/// Password for `username` at `connection`, falling back to an item stored without a
/// connection.
pub async fn resolve_password(
    store: &dyn CredentialStore,
    connection: &str,
    username: &str,
) -> ProviderResult<Option<String>> {
    if let Some(password) = store.lookup(Some(connection), username).await? {
        return Ok(Some(password));
    }
    store.lookup(None, username).await
}

/// In-process store, used in tests and when no desktop store is available.
///
/// Lookups match the way the secret service does: an item matches when it carries every
/// requested attribute, whatever else it carries.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    items: Mutex<Vec<(HashMap<String, String>, String)>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items carrying all wanted attributes; with `exact`, no others either.
    fn matching(
        &self,
        connection: Option<&str>,
        username: &str,
        exact: bool,
    ) -> Vec<(usize, String)> {
        let wanted = attributes(connection, username);
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items
            .iter()
            .enumerate()
            .filter(|(_, (attrs, _))| {
                (!exact || attrs.len() == wanted.len())
                    && wanted
                        .iter()
                        .all(|(k, v)| attrs.get(*k).map(String::as_str) == Some(*v))
            })
            .map(|(index, (_, secret))| (index, secret.clone()))
            .collect()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn search(&self, connection: Option<&str>, username: &str) -> ProviderResult<Vec<String>> {
        Ok(self
            .matching(connection, username, false)
            .into_iter()
            .map(|(index, _)| format!("/memory/item/{}", index))
            .collect())
    }

    async fn lookup(
        &self,
        connection: Option<&str>,
        username: &str,
    ) -> ProviderResult<Option<String>> {
        Ok(self
            .matching(connection, username, false)
            .into_iter()
            .next()
            .map(|(_, secret)| secret))
    }

    async fn set(
        &self,
        connection: Option<&str>,
        username: &str,
        password: &str,
    ) -> ProviderResult<()> {
        let existing = self.matching(connection, username, true);
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        match existing.first() {
            Some((index, _)) => items[*index].1 = password.to_string(),
            None => items.push((
                attributes(connection, username)
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                password.to_string(),
            )),
        }
        Ok(())
    }
}

#[cfg(feature = "secret-service")]
pub use self::secret::SecretServiceStore;

#[cfg(feature = "secret-service")]
mod secret {
    use super::{CredentialStore, attributes};
    use crate::error::{ProviderError, ProviderResult};
    use async_trait::async_trait;
    use secret_service::{EncryptionType, SecretService};

    fn store_error(e: secret_service::Error) -> ProviderError {
        ProviderError::credentials(e.to_string())
    }

    /// Freedesktop secret service over D-Bus.
    #[derive(Debug, Default)]
    pub struct SecretServiceStore;

    impl SecretServiceStore {
        pub fn new() -> Self {
            Self
        }

        async fn connect(&self) -> ProviderResult<SecretService<'static>> {
            SecretService::connect(EncryptionType::Dh)
                .await
                .map_err(store_error)
        }
    }

    #[async_trait]
    impl CredentialStore for SecretServiceStore {
        async fn search(
            &self,
            connection: Option<&str>,
            username: &str,
        ) -> ProviderResult<Vec<String>> {
            let service = self.connect().await?;
            let found = service
                .search_items(attributes(connection, username))
                .await
                .map_err(store_error)?;
            Ok(found
                .unlocked
                .iter()
                .chain(found.locked.iter())
                .map(|item| item.item_path.to_string())
                .collect())
        }

        async fn lookup(
            &self,
            connection: Option<&str>,
            username: &str,
        ) -> ProviderResult<Option<String>> {
            let service = self.connect().await?;
            let found = service
                .search_items(attributes(connection, username))
                .await
                .map_err(store_error)?;
            let Some(item) = found.unlocked.first().or(found.locked.first()) else {
                return Ok(None);
            };
            if item.is_locked().await.map_err(store_error)? {
                item.unlock().await.map_err(store_error)?;
            }
            let secret = item.get_secret().await.map_err(store_error)?;
            String::from_utf8(secret)
                .map(Some)
                .map_err(|_| ProviderError::credentials("Stored secret is not valid UTF-8"))
        }

        async fn set(
            &self,
            connection: Option<&str>,
            username: &str,
            password: &str,
        ) -> ProviderResult<()> {
            let service = self.connect().await?;
            let collection = service
                .get_default_collection()
                .await
                .map_err(store_error)?;
            if collection.is_locked().await.map_err(store_error)? {
                collection.unlock().await.map_err(store_error)?;
            }
            let label = match connection {
                Some(connection) => format!("Exasol password for {}@{}", username, connection),
                None => format!("Exasol password for {}", username),
            };
            collection
                .create_item(
                    &label,
                    attributes(connection, username),
                    password.as_bytes(),
                    true,
                    "text/plain",
                )
                .await
                .map_err(store_error)?;
            Ok(())
        }
    }
}

/// Store used by the provider process.
pub fn default_store() -> ProviderResult<Box<dyn CredentialStore>> {
    #[cfg(feature = "secret-service")]
    {
        Ok(Box::new(SecretServiceStore::new()))
    }
    #[cfg(not(feature = "secret-service"))]
    {
        Err(ProviderError::credentials(
            "Built without the secret-service feature",
        ))
    }
}

/// Command line of `secretserviceclient`.
#[derive(Debug, Parser)]
#[command(
    name = "secretserviceclient",
    version,
    about = "Manage exasol-provider passwords in the desktop secret service"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum CliCommand {
    /// Print the paths of stored items matching the connection and username
    Search {
        /// host:port of the database
        connection: String,
        username: String,
    },
    /// Prompt for a password and store it
    #[command(allow_missing_positional = true)]
    Set {
        /// host:port of the database; omitted to store a password for any connection
        connection: Option<String>,
        username: String,
    },
}

pub const EXIT_USAGE: i32 = 1;
pub const EXIT_FAILURE: i32 = 2;
