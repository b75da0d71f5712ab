//! ## Pool Catalog
//!
//! Read-only registry mapping a pool identifier to its [`PoolDefinition`]. The catalog is
//! assembled once at service start from the built-in pools and the `[[pools]]` entries
//! of the configuration, and is never mutated afterwards.
//!
//! Each pool carries its [`CredentialFormat`], selected at load time, so building a
//! worker command needs a single dispatch instead of per-host string checks.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::Serialize;

use crate::{
    config::{CredentialFormatConfig, PoolConfig},
    error::{OrchestratorError, OrchestratorResult},
};

/// The `-u`/`-p` pair handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

type CredentialFn = dyn Fn(&str, &str) -> Credentials + Send + Sync;

/// How a pool combines a wallet and a worker name into worker credentials.
#[derive(Clone)]
pub enum CredentialFormat {
    /// `wallet<separator>worker` as user and a literal password.
    Concat { separator: String, password: String },
    /// The raw wallet as user and a pool-specific sentinel password.
    WalletOnly { password: String },
    /// Any other rule, called with `(wallet, worker)`.
    Custom(Arc<CredentialFn>),
}

impl CredentialFormat {
    pub fn concat(separator: &str, password: &str) -> Self {
        CredentialFormat::Concat {
            separator: separator.to_string(),
            password: password.to_string(),
        }
    }

    pub fn wallet_only(password: &str) -> Self {
        CredentialFormat::WalletOnly {
            password: password.to_string(),
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str, &str) -> Credentials + Send + Sync + 'static,
    {
        CredentialFormat::Custom(Arc::new(f))
    }

    /// Formats credentials for `wallet` and `worker`.
    ///
    /// An empty worker name leaves the wallet untouched under `Concat`.
    pub fn credentials(&self, wallet: &str, worker: &str) -> Credentials {
        match self {
            CredentialFormat::Concat {
                separator,
                password,
            } => {
                let user = if worker.is_empty() {
                    wallet.to_string()
                } else {
                    format!("{wallet}{separator}{worker}")
                };
                Credentials {
                    user,
                    password: password.clone(),
                }
            }
            CredentialFormat::WalletOnly { password } => Credentials {
                user: wallet.to_string(),
                password: password.clone(),
            },
            CredentialFormat::Custom(f) => f(wallet, worker),
        }
    }
}

impl fmt::Debug for CredentialFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialFormat::Concat {
                separator,
                password,
            } => f
                .debug_struct("Concat")
                .field("separator", separator)
                .field("password", password)
                .finish(),
            CredentialFormat::WalletOnly { password } => f
                .debug_struct("WalletOnly")
                .field("password", password)
                .finish(),
            CredentialFormat::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl From<CredentialFormatConfig> for CredentialFormat {
    fn from(config: CredentialFormatConfig) -> Self {
        match config {
            CredentialFormatConfig::Concat {
                separator,
                password,
            } => CredentialFormat::Concat {
                separator,
                password,
            },
            CredentialFormatConfig::WalletOnly { password } => {
                CredentialFormat::WalletOnly { password }
            }
            CredentialFormatConfig::Template { user, password } => {
                CredentialFormat::custom(move |wallet, worker| Credentials {
                    user: fill_template(&user, wallet, worker),
                    password: fill_template(&password, wallet, worker),
                })
            }
        }
    }
}

fn fill_template(template: &str, wallet: &str, worker: &str) -> String {
    template
        .replace("{wallet}", wallet)
        .replace("{worker}", worker)
}

/// A pool the orchestrator can point workers at.
#[derive(Debug, Clone)]
pub struct PoolDefinition {
    pub id: String,
    pub name: String,
    /// Connection string in `scheme://host:port` form, passed to the worker verbatim.
    pub url: String,
    pub algorithm: String,
    pub credential_format: CredentialFormat,
}

impl PoolDefinition {
    pub fn new(
        id: &str,
        name: &str,
        url: &str,
        algorithm: &str,
        credential_format: CredentialFormat,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            algorithm: algorithm.to_string(),
            credential_format,
        }
    }

    /// Public view of this pool, without the credential rule.
    pub fn view(&self) -> PoolView {
        PoolView {
            id: self.id.clone(),
            name: self.name.clone(),
            url: self.url.clone(),
            algorithm: self.algorithm.clone(),
        }
    }

    fn validate(&self) -> OrchestratorResult<()> {
        if self.id.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "pool id must not be empty".to_string(),
            ));
        }
        if self.algorithm.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig(format!(
                "pool `{}` has no algorithm",
                self.id
            )));
        }
        match self.url.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => Ok(()),
            _ => Err(OrchestratorError::InvalidConfig(format!(
                "pool `{}` url `{}` is not in scheme://host:port form",
                self.id, self.url
            ))),
        }
    }
}

impl TryFrom<PoolConfig> for PoolDefinition {
    type Error = OrchestratorError;

    fn try_from(config: PoolConfig) -> Result<Self, Self::Error> {
        let definition = PoolDefinition {
            name: config.name.unwrap_or_else(|| config.id.clone()),
            id: config.id,
            url: config.url,
            algorithm: config.algorithm,
            credential_format: config.credential_format.into(),
        };
        definition.validate()?;
        Ok(definition)
    }
}

/// Pool information exposed to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolView {
    pub id: String,
    pub name: String,
    pub url: String,
    pub algorithm: String,
}

/// The pool registry.
#[derive(Debug, Clone, Default)]
pub struct PoolCatalog {
    pools: BTreeMap<String, PoolDefinition>,
}

impl PoolCatalog {
    /// Creates a catalog from `pools`. A later definition replaces an earlier one with the
    /// same identifier.
    pub fn new(pools: Vec<PoolDefinition>) -> Self {
        let pools = pools.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self { pools }
    }

    /// Pools known without any configuration.
    pub fn builtin() -> Self {
        Self::new(vec![
            PoolDefinition::new(
                "litecoin",
                "LitecoinPool.org",
                "stratum+tcp://litecoinpool.org:3333",
                "scrypt",
                CredentialFormat::concat(".", "x"),
            ),
            PoolDefinition::new(
                "nicehash-scrypt",
                "NiceHash (scrypt)",
                "stratum+tcp://scrypt.auto.nicehash.com:9200",
                "scrypt",
                CredentialFormat::concat(".", "x"),
            ),
            PoolDefinition::new(
                "zpool-scrypt",
                "zpool (scrypt)",
                "stratum+tcp://scrypt.mine.zpool.ca:3433",
                "scrypt",
                CredentialFormat::wallet_only("c=LTC"),
            ),
            // MoneroOcean takes the worker name in the password field.
            PoolDefinition::new(
                "moneroocean",
                "MoneroOcean",
                "stratum+tcp://gulf.moneroocean.stream:10128",
                "randomx",
                CredentialFormat::custom(|wallet, worker| Credentials {
                    user: wallet.to_string(),
                    password: if worker.is_empty() {
                        "x".to_string()
                    } else {
                        worker.to_string()
                    },
                }),
            ),
        ])
    }

    /// Built-in pools overlaid with the configured ones.
    pub fn from_config(pools: &[PoolConfig]) -> OrchestratorResult<Self> {
        let mut catalog = Self::builtin();
        for pool in pools.iter().cloned() {
            let definition = PoolDefinition::try_from(pool)?;
            catalog.pools.insert(definition.id.clone(), definition);
        }
        Ok(catalog)
    }

    /// Looks up a pool. The returned definition is a snapshot owned by the caller.
    pub fn resolve(&self, pool_id: &str) -> OrchestratorResult<PoolDefinition> {
        self.pools
            .get(pool_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownPool(pool_id.to_string()))
    }

    /// Every pool, ordered by identifier, without credential rules.
    pub fn list(&self) -> Vec<PoolView> {
        self.pools.values().map(PoolDefinition::view).collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
