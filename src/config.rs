use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub gitea: GiteaConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Secrets resolved from the environment at load time.
    #[serde(skip)]
    pub credentials: Credentials,
}

impl Config {
    /// Base URL used to build clone URLs handed back to callers.
    pub fn public_url(&self) -> &str {
        self.gitea
            .public_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.gitea.url)
    }
}

// ---------------------------------------------------------------------------
// Gitea
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GiteaConfig {
    /// Base URL the service uses to reach Gitea (API calls and pushes).
    pub url: String,
    /// Externally reachable base URL for clone URLs.  Falls back to `url`.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Account that owns every published repository.
    pub owner: String,
    /// Name of the environment variable that holds the Gitea API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_token_env() -> String {
    "GITEA_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Name of the environment variable holding the optional shared secret.
    /// When the variable is unset or empty, authentication is disabled.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Upper bound on a multipart upload body.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_key_env: default_api_key_env(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_api_key_env() -> String {
    "ZIP_AGENT_API_KEY".to_string()
}

fn default_max_upload_bytes() -> usize {
    100 << 20
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Directory under which each upload gets its own `project-<id>` subdirectory.
    #[serde(default = "default_sandbox_root")]
    pub root: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: default_sandbox_root(),
        }
    }
}

fn default_sandbox_root() -> PathBuf {
    PathBuf::from("/tmp/zip-agent")
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_git_binary")]
    pub binary: String,
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default = "default_user_email")]
    pub user_email: String,
    /// Primary branch every upload is force-pushed to.
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_remote")]
    pub remote: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            user_name: default_user_name(),
            user_email: default_user_email(),
            branch: default_branch(),
            remote: default_remote(),
        }
    }
}

fn default_git_binary() -> String {
    "git".to_string()
}

fn default_user_name() -> String {
    "Nomo Bot".to_string()
}

fn default_user_email() -> String {
    "nomo@nomoo.top".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Per-request timeout (seconds) for Gitea API calls.
    #[serde(default = "default_http_secs")]
    pub http_secs: u64,
    /// Per-invocation timeout (seconds) for git subprocesses.
    #[serde(default = "default_git_secs")]
    pub git_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            http_secs: default_http_secs(),
            git_secs: default_git_secs(),
        }
    }
}

fn default_http_secs() -> u64 {
    30
}

fn default_git_secs() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct Credentials {
    pub gitea_token: String,
    /// Shared secret for `Authorization: Bearer`.  `None` disables auth.
    pub api_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("gitea_token", &"<redacted>")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
///
/// Secrets are read from the environment variables the file names.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    config.credentials = Credentials {
        gitea_token: std::env::var(&config.gitea.token_env).unwrap_or_default(),
        api_key: non_empty(std::env::var(&config.server.api_key_env).ok()),
    };
    validate_config(&config)?;
    Ok(config)
}

/// Build a [`Config`] from the flat environment variables used by earlier
/// deployments (`GITEA_URL`, `GITEA_TOKEN`, `GITEA_OWNER`, ...).
pub fn config_from_env() -> Result<Config> {
    config_from_lookup(|key| std::env::var(key).ok())
}

fn config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let get = |key: &str| non_empty(lookup(key));

    let mut server = ServerConfig::default();
    if let Some(port) = get("PORT") {
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid PORT value: {port}"))?;
        server.listen = format!("0.0.0.0:{port}");
    }

    let mut sandbox = SandboxConfig::default();
    if let Some(root) = get("FORGEDROP_WORK_DIR") {
        sandbox.root = PathBuf::from(root);
    }

    let config = Config {
        gitea: GiteaConfig {
            url: get("GITEA_URL").unwrap_or_default(),
            public_url: get("GITEA_PUBLIC_URL"),
            owner: get("GITEA_OWNER").unwrap_or_default(),
            token_env: default_token_env(),
        },
        credentials: Credentials {
            gitea_token: get("GITEA_TOKEN").unwrap_or_default(),
            api_key: get(&server.api_key_env),
        },
        server,
        sandbox,
        git: GitConfig::default(),
        timeouts: TimeoutConfig::default(),
    };
    validate_config(&config)?;
    Ok(config)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(!config.gitea.url.is_empty(), "gitea.url must be set");
    anyhow::ensure!(!config.gitea.owner.is_empty(), "gitea.owner must be set");
    anyhow::ensure!(
        !config.credentials.gitea_token.is_empty(),
        "Gitea token must be set (env var {})",
        config.gitea.token_env
    );
    for url in [config.gitea.url.as_str(), config.public_url()] {
        let parsed = reqwest::Url::parse(url).with_context(|| format!("invalid URL: {url}"))?;
        anyhow::ensure!(
            matches!(parsed.scheme(), "http" | "https"),
            "URL must use http or https: {url}"
        );
    }
    anyhow::ensure!(config.timeouts.http_secs > 0, "timeouts.http_secs must be > 0");
    anyhow::ensure!(config.timeouts.git_secs > 0, "timeouts.git_secs must be > 0");
    anyhow::ensure!(!config.git.branch.is_empty(), "git.branch must be set");
    anyhow::ensure!(!config.git.remote.is_empty(), "git.remote must be set");
    anyhow::ensure!(
        config.server.max_upload_bytes > 0,
        "server.max_upload_bytes must be > 0"
    );
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_config(url: &str, sandbox_root: &Path) -> Config {
    Config {
        gitea: GiteaConfig {
            url: url.to_string(),
            public_url: None,
            owner: "deployer".to_string(),
            token_env: default_token_env(),
        },
        server: ServerConfig::default(),
        sandbox: SandboxConfig {
            root: sandbox_root.to_path_buf(),
        },
        git: GitConfig::default(),
        timeouts: TimeoutConfig::default(),
        credentials: Credentials {
            gitea_token: "s3cret-token".to_string(),
            api_key: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_config_defaults() {
        let config = config_from_lookup(lookup(&[
            ("GITEA_URL", "http://gitea:3000"),
            ("GITEA_TOKEN", "tok"),
            ("GITEA_OWNER", "bot"),
        ]))
        .unwrap();

        assert_eq!(config.public_url(), "http://gitea:3000");
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.server.max_upload_bytes, 100 * 1024 * 1024);
        assert_eq!(config.sandbox.root, PathBuf::from("/tmp/zip-agent"));
        assert_eq!(config.git.branch, "main");
        assert!(config.credentials.api_key.is_none());
    }

    #[test]
    fn env_config_overrides() {
        let config = config_from_lookup(lookup(&[
            ("GITEA_URL", "http://gitea:3000"),
            ("GITEA_PUBLIC_URL", "https://git.example.com"),
            ("GITEA_TOKEN", "tok"),
            ("GITEA_OWNER", "bot"),
            ("ZIP_AGENT_API_KEY", "shh"),
            ("PORT", "9090"),
            ("FORGEDROP_WORK_DIR", "/var/lib/forgedrop"),
        ]))
        .unwrap();

        assert_eq!(config.public_url(), "https://git.example.com");
        assert_eq!(config.server.listen, "0.0.0.0:9090");
        assert_eq!(config.sandbox.root, PathBuf::from("/var/lib/forgedrop"));
        assert_eq!(config.credentials.api_key.as_deref(), Some("shh"));
    }

    #[test]
    fn env_config_requires_token() {
        let err = config_from_lookup(lookup(&[
            ("GITEA_URL", "http://gitea:3000"),
            ("GITEA_OWNER", "bot"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn env_config_rejects_bad_port() {
        assert!(config_from_lookup(lookup(&[
            ("GITEA_URL", "http://gitea:3000"),
            ("GITEA_TOKEN", "tok"),
            ("GITEA_OWNER", "bot"),
            ("PORT", "eighty"),
        ]))
        .is_err());
    }

    #[test]
    fn rejects_non_http_url() {
        assert!(config_from_lookup(lookup(&[
            ("GITEA_URL", "ftp://gitea"),
            ("GITEA_TOKEN", "tok"),
            ("GITEA_OWNER", "bot"),
        ]))
        .is_err());
    }

    #[test]
    fn yaml_config_resolves_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
gitea:
  url: http://gitea:3000
  owner: bot
  token_env: FORGEDROP_TEST_YAML_TOKEN
sandbox:
  root: /srv/uploads
git:
  branch: deploy
timeouts:
  git_secs: 60
"#,
        )
        .unwrap();
        std::env::set_var("FORGEDROP_TEST_YAML_TOKEN", "from-env");

        let config = load_config(&path).unwrap();
        assert_eq!(config.credentials.gitea_token, "from-env");
        assert_eq!(config.sandbox.root, PathBuf::from("/srv/uploads"));
        assert_eq!(config.git.branch, "deploy");
        assert_eq!(config.git.remote, "origin");
        assert_eq!(config.timeouts.git_secs, 60);
        assert_eq!(config.timeouts.http_secs, 30);
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials {
            gitea_token: "abc".to_string(),
            api_key: Some("xyz".to_string()),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("abc"));
        assert!(!rendered.contains("xyz"));
    }
}
