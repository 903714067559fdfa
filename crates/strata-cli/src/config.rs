//! Configuration for the `strata` binary.
//!
//! Configuration is loaded from environment variables with sensible defaults.
//! The image and command come from positional arguments.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use strata_core::{LayerSelection, RunConfig, DEFAULT_EXIT_TIMEOUT};
use strata_host::NetworkMode;

/// Usage line printed for bad invocations.
pub const USAGE: &str = "usage: strata <image> <command...>";

/// Configuration for the Strata runner.
#[derive(Debug, Clone)]
pub struct StrataConfig {
    /// Directory holding one subdirectory per image.
    pub image_root: PathBuf,

    /// Directory under which per-run sandboxes are created.
    pub sandbox_root: PathBuf,

    /// Network mode to attach containers to (default: nat).
    pub network_mode: NetworkMode,

    /// Bound on waiting for the guest to exit (default: 5000 ms).
    pub exit_timeout: Duration,

    /// Which layers of the image to mount (default: full).
    pub layer_selection: LayerSelection,
}

/// Configuration or invocation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("image directory not found: {0}")]
    MissingImageRoot(PathBuf),

    #[error("sandbox parent directory not found: {0}")]
    InvalidSandboxRoot(PathBuf),

    #[error("exit timeout must be greater than zero")]
    ZeroTimeout,

    #[error("{USAGE}")]
    Usage,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            image_root: PathBuf::from("/var/lib/strata/images"),
            sandbox_root: PathBuf::from("/tmp/strata/sandboxes"),
            network_mode: NetworkMode::Nat,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
            layer_selection: LayerSelection::Full,
        }
    }
}

/// Parse `value`, falling back to `default` with a warning when it is
/// unusable.
fn parse_or<T: FromStr>(var: &str, value: Option<String>, default: T) -> T {
    match value {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(var, value = %raw, "Ignoring invalid value");
            default
        }),
        None => default,
    }
}

impl StrataConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `STRATA_IMAGE_ROOT` | `/var/lib/strata/images` |
    /// | `STRATA_SANDBOX_ROOT` | `/tmp/strata/sandboxes` |
    /// | `STRATA_NETWORK_MODE` | `nat` (nat, transparent, l2bridge, internal) |
    /// | `STRATA_EXIT_TIMEOUT_MS` | `5000` |
    /// | `STRATA_LAYER_SELECTION` | `full` (full, base) |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        let exit_timeout_ms = parse_or(
            "STRATA_EXIT_TIMEOUT_MS",
            lookup("STRATA_EXIT_TIMEOUT_MS"),
            default.exit_timeout.as_millis() as u64,
        );

        Self {
            image_root: lookup("STRATA_IMAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.image_root),
            sandbox_root: lookup("STRATA_SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.sandbox_root),
            network_mode: parse_or(
                "STRATA_NETWORK_MODE",
                lookup("STRATA_NETWORK_MODE"),
                default.network_mode,
            ),
            exit_timeout: Duration::from_millis(exit_timeout_ms),
            layer_selection: parse_or(
                "STRATA_LAYER_SELECTION",
                lookup("STRATA_LAYER_SELECTION"),
                default.layer_selection,
            ),
        }
    }

    /// Validate that the configured directories are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.image_root.is_dir() {
            return Err(ConfigError::MissingImageRoot(self.image_root.clone()));
        }

        // Sandbox root is created on demand, so just check the parent exists
        if let Some(parent) = self.sandbox_root.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ConfigError::InvalidSandboxRoot(self.sandbox_root.clone()));
            }
        }

        if self.exit_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(())
    }

    /// Validate configuration but only log warnings instead of failing.
    pub fn validate_warn(&self) {
        if let Err(e) = self.validate() {
            tracing::warn!(error = %e, "Configuration may not work");
        }
    }

    /// Orchestrator settings derived from this configuration.
    pub fn run_config(&self) -> strata_core::Result<RunConfig> {
        RunConfig::builder()
            .sandbox_root(&self.sandbox_root)
            .network_mode(self.network_mode)
            .exit_timeout(self.exit_timeout)
            .layer_selection(self.layer_selection)
            .build()
    }
}

/// What the user asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub image: String,
    pub command_line: String,
}

impl Invocation {
    /// Parse `strata <image> <command...>` from arguments (program name
    /// excluded). Command words are joined with single spaces.
    pub fn parse<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = args.into_iter();
        let image = args.next().filter(|s| !s.is_empty()).ok_or(ConfigError::Usage)?;
        let command_line = args.collect::<Vec<_>>().join(" ");
        if command_line.trim().is_empty() {
            return Err(ConfigError::Usage);
        }
        Ok(Self {
            image,
            command_line,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_config() {
        let config = StrataConfig::default();
        assert_eq!(config.image_root, PathBuf::from("/var/lib/strata/images"));
        assert_eq!(config.sandbox_root, PathBuf::from("/tmp/strata/sandboxes"));
        assert_eq!(config.network_mode, NetworkMode::Nat);
        assert_eq!(config.exit_timeout, Duration::from_millis(5000));
        assert_eq!(config.layer_selection, LayerSelection::Full);
    }

    #[test]
    fn test_from_lookup_uses_defaults() {
        let config = StrataConfig::from_lookup(lookup(&[]));
        let default = StrataConfig::default();

        assert_eq!(config.image_root, default.image_root);
        assert_eq!(config.sandbox_root, default.sandbox_root);
        assert_eq!(config.network_mode, default.network_mode);
        assert_eq!(config.exit_timeout, default.exit_timeout);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = StrataConfig::from_lookup(lookup(&[
            ("STRATA_IMAGE_ROOT", "/srv/images"),
            ("STRATA_SANDBOX_ROOT", "/srv/sandboxes"),
            ("STRATA_NETWORK_MODE", "Transparent"),
            ("STRATA_EXIT_TIMEOUT_MS", "250"),
            ("STRATA_LAYER_SELECTION", "base"),
        ]));

        assert_eq!(config.image_root, PathBuf::from("/srv/images"));
        assert_eq!(config.sandbox_root, PathBuf::from("/srv/sandboxes"));
        assert_eq!(config.network_mode, NetworkMode::Transparent);
        assert_eq!(config.exit_timeout, Duration::from_millis(250));
        assert_eq!(config.layer_selection, LayerSelection::Base);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = StrataConfig::from_lookup(lookup(&[
            ("STRATA_NETWORK_MODE", "wormhole"),
            ("STRATA_EXIT_TIMEOUT_MS", "soon"),
        ]));
        assert_eq!(config.network_mode, NetworkMode::Nat);
        assert_eq!(config.exit_timeout, DEFAULT_EXIT_TIMEOUT);
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::tempdir().unwrap();
        let config = StrataConfig {
            image_root: dir.path().to_path_buf(),
            sandbox_root: dir.path().join("sandboxes"),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let missing = StrataConfig {
            image_root: dir.path().join("nope"),
            ..config.clone()
        };
        assert!(matches!(
            missing.validate(),
            Err(ConfigError::MissingImageRoot(_))
        ));

        let zero = StrataConfig {
            exit_timeout: Duration::ZERO,
            ..config
        };
        assert!(matches!(zero.validate(), Err(ConfigError::ZeroTimeout)));
    }

    #[test]
    fn test_run_config() {
        let config = StrataConfig {
            exit_timeout: Duration::from_millis(100),
            layer_selection: LayerSelection::Base,
            ..Default::default()
        };
        let run = config.run_config().unwrap();
        assert_eq!(run.sandbox_root, config.sandbox_root);
        assert_eq!(run.exit_timeout, Duration::from_millis(100));
        assert_eq!(run.layer_selection, LayerSelection::Base);
    }

    #[test]
    fn test_invocation_parse() {
        let invocation =
            Invocation::parse(args(&["runtime:4.8", "echo", "hello", "world"])).unwrap();
        assert_eq!(invocation.image, "runtime:4.8");
        assert_eq!(invocation.command_line, "echo hello world");
    }

    #[test]
    fn test_invocation_requires_command() {
        assert!(matches!(Invocation::parse(args(&[])), Err(ConfigError::Usage)));
        assert!(matches!(
            Invocation::parse(args(&["runtime:4.8"])),
            Err(ConfigError::Usage)
        ));
        assert!(matches!(
            Invocation::parse(args(&["", "echo"])),
            Err(ConfigError::Usage)
        ));
    }
}
