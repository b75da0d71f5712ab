//! ## Command Builder
//!
//! Turns a resolved [`PoolDefinition`] and a [`JobRequest`] into the
//! [`ExecutableCommand`] a worker is launched with.
//!
//! Worker binaries are looked up in a [`BinaryRegistry`] keyed by algorithm and
//! [`Platform`]. A binary that is not registered, or not present on disk, is reported as
//! [`OrchestratorError::BinaryUnavailable`] before anything is spawned.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::{
    config::BinaryConfig,
    error::{OrchestratorError, OrchestratorResult},
    job::JobRequest,
    pool_catalog::PoolDefinition,
};

/// Operating system and CPU architecture a worker binary is built for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    os: String,
    arch: String,
}

impl Platform {
    pub fn new(os: &str, arch: &str) -> Self {
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
        }
    }

    /// The platform this process runs on.
    pub fn host() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

impl FromStr for Platform {
    type Err = OrchestratorError;

    /// Parses `os-arch`, e.g. `linux-x86_64` or `macos-aarch64`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((os, arch)) if !os.is_empty() && !arch.is_empty() => Ok(Self::new(os, arch)),
            _ => Err(OrchestratorError::InvalidConfig(format!(
                "platform `{s}` is not in os-arch form"
            ))),
        }
    }
}

/// Worker binaries by `(algorithm, platform)`.
#[derive(Debug, Clone, Default)]
pub struct BinaryRegistry {
    binaries: HashMap<(String, Platform), PathBuf>,
}

impl BinaryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(binaries: &[BinaryConfig]) -> OrchestratorResult<Self> {
        let mut registry = Self::new();
        for binary in binaries {
            let platform = match &binary.platform {
                Some(p) => p.parse()?,
                None => Platform::host(),
            };
            registry.register(&binary.algorithm, platform, binary.path.clone());
        }
        Ok(registry)
    }

    pub fn register(&mut self, algorithm: &str, platform: Platform, path: PathBuf) {
        self.binaries
            .insert((algorithm.to_ascii_lowercase(), platform), path);
    }

    /// Returns the binary for `algorithm` on `platform`, provided it exists on disk.
    pub fn resolve(&self, algorithm: &str, platform: &Platform) -> OrchestratorResult<&Path> {
        let unavailable = || OrchestratorError::BinaryUnavailable {
            algorithm: algorithm.to_string(),
            platform: platform.to_string(),
        };
        let path = self
            .binaries
            .get(&(algorithm.to_ascii_lowercase(), platform.clone()))
            .ok_or_else(unavailable)?;
        if !path.is_file() {
            return Err(unavailable());
        }
        Ok(path)
    }
}

/// A resolved worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl fmt::Display for ExecutableCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Builds worker invocations for the host platform.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    binaries: BinaryRegistry,
    platform: Platform,
}

impl CommandBuilder {
    pub fn new(binaries: BinaryRegistry) -> Self {
        Self::for_platform(binaries, Platform::host())
    }

    pub fn for_platform(binaries: BinaryRegistry, platform: Platform) -> Self {
        Self { binaries, platform }
    }

    /// `binary --algo=<algo> -o <url> -u <user> -p <password> -t <threads> [--intensity=<n>]`
    pub fn build(
        &self,
        pool: &PoolDefinition,
        request: &JobRequest,
    ) -> OrchestratorResult<ExecutableCommand> {
        let algorithm = request.algorithm.as_deref().unwrap_or(&pool.algorithm);
        let program = self.binaries.resolve(algorithm, &self.platform)?;
        let credentials = pool
            .credential_format
            .credentials(&request.wallet, &request.worker);

        let mut args = vec![
            format!("--algo={algorithm}"),
            "-o".to_string(),
            pool.url.clone(),
            "-u".to_string(),
            credentials.user,
            "-p".to_string(),
            credentials.password,
            "-t".to_string(),
            request.threads.to_string(),
        ];
        if let Some(intensity) = request.intensity {
            args.push(format!("--intensity={intensity}"));
        }

        Ok(ExecutableCommand {
            program: program.to_path_buf(),
            args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool_catalog::PoolCatalog;

    fn builder_with_binary(algorithm: &str) -> (CommandBuilder, tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binary");
        std::fs::write(&path, b"").unwrap();
        let mut registry = BinaryRegistry::new();
        registry.register(algorithm, Platform::host(), path.clone());
        (CommandBuilder::new(registry), dir, path)
    }

    #[test]
    fn test_build_litecoin_command() {
        let (builder, _dir, path) = builder_with_binary("scrypt");
        let pool = PoolCatalog::builtin().resolve("litecoin").unwrap();
        let command = builder
            .build(&pool, &JobRequest::new("litecoin", "abc", "w1", 4))
            .unwrap();
        assert_eq!(command.program, path);
        assert_eq!(
            command.args,
            vec![
                "--algo=scrypt",
                "-o",
                "stratum+tcp://litecoinpool.org:3333",
                "-u",
                "abc.w1",
                "-p",
                "x",
                "-t",
                "4"
            ]
        );
    }

    #[test]
    fn test_build_appends_intensity() {
        let (builder, _dir, _path) = builder_with_binary("scrypt");
        let pool = PoolCatalog::builtin().resolve("zpool-scrypt").unwrap();
        let command = builder
            .build(
                &pool,
                &JobRequest::new("zpool-scrypt", "Ltc1", "rig", 2).with_intensity(12),
            )
            .unwrap();
        assert_eq!(command.args[4], "Ltc1");
        assert_eq!(command.args[6], "c=LTC");
        assert_eq!(command.args.last().map(String::as_str), Some("--intensity=12"));
    }

    #[test]
    fn test_unregistered_binary_is_unavailable() {
        let builder = CommandBuilder::new(BinaryRegistry::new());
        let pool = PoolCatalog::builtin().resolve("litecoin").unwrap();
        match builder.build(&pool, &JobRequest::new("litecoin", "abc", "w1", 4)) {
            Err(OrchestratorError::BinaryUnavailable { algorithm, .. }) => {
                assert_eq!(algorithm, "scrypt")
            }
            other => panic!("Expected BinaryUnavailable, got: {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let mut registry = BinaryRegistry::new();
        registry.register(
            "scrypt",
            Platform::host(),
            PathBuf::from("/nonexistent/worker-binary"),
        );
        let builder = CommandBuilder::new(registry);
        let pool = PoolCatalog::builtin().resolve("litecoin").unwrap();
        assert!(matches!(
            builder.build(&pool, &JobRequest::new("litecoin", "abc", "w1", 4)),
            Err(OrchestratorError::BinaryUnavailable { .. })
        ));
    }

    #[test]
    fn test_binary_for_other_platform_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binary");
        std::fs::write(&path, b"").unwrap();
        let mut registry = BinaryRegistry::new();
        registry.register("scrypt", Platform::new("plan9", "mips"), path);
        let builder = CommandBuilder::new(registry);
        let pool = PoolCatalog::builtin().resolve("litecoin").unwrap();
        assert!(builder
            .build(&pool, &JobRequest::new("litecoin", "abc", "w1", 4))
            .is_err());
    }

    #[test]
    fn test_platform_parsing() {
        let platform: Platform = "linux-x86_64".parse().unwrap();
        assert_eq!(platform, Platform::new("linux", "x86_64"));
        assert_eq!(platform.to_string(), "linux-x86_64");
        assert!("linux".parse::<Platform>().is_err());
    }

    #[test]
    fn test_display_command_line() {
        let command = ExecutableCommand {
            program: PathBuf::from("/opt/cpuminer"),
            args: vec!["--algo=scrypt".to_string(), "-t".to_string(), "4".to_string()],
        };
        assert_eq!(command.to_string(), "/opt/cpuminer --algo=scrypt -t 4");
    }
}
