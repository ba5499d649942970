//! Deployment configuration loaded from `.env`
//!
//! The file is read once per run into an immutable [`DeploySettings`] which
//! every later step borrows. Nothing is exported into the process
//! environment; the compose step passes [`DeploySettings::compose_env`] to its
//! child processes explicitly.

use std::collections::BTreeMap;

use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};
use url::Url;

use crate::app::prompt::Confirm;
use crate::deploy::outcome::Outcome;
use crate::errors::DeployError;
use crate::storage::layout::StorageLayout;

/// Site domain shipped in `.env.example`
pub const PLACEHOLDER_DOMAIN: &str = "your-domain.com";

/// API domain shipped in `.env.example`
pub const PLACEHOLDER_API_DOMAIN: &str = "api.your-domain.com";

/// Optional keys and the values used when they are unset or empty
const DEFAULTS: [(&str, &str); 12] = [
    ("DOMAIN", PLACEHOLDER_DOMAIN),
    ("API_DOMAIN", PLACEHOLDER_API_DOMAIN),
    ("SSL_EMAIL", "admin@your-domain.com"),
    ("FRONTEND_PORT", "3000"),
    ("BACKEND_PORT", "8000"),
    ("POSTGRES_USER", "postgres"),
    ("POSTGRES_DB", "app"),
    ("MINIO_API_PORT", "9000"),
    ("MINIO_CONSOLE_PORT", "9001"),
    ("COMPOSE_PROJECT_NAME", "stackup"),
    ("BACKEND_HEALTH_PATH", "/health"),
    ("NODE_ENV", "production"),
];

const SECRET_KEYS: [&str; 5] = [
    "JWT_SECRET",
    "JWT_REFRESH_SECRET",
    "POSTGRES_PASSWORD",
    "MINIO_ACCESS_KEY",
    "MINIO_SECRET_KEY",
];

/// Each pair is expected to hold two different strings
const SECRET_PAIRS: [(&str, &str); 2] = [
    ("JWT_SECRET", "JWT_REFRESH_SECRET"),
    ("MINIO_SECRET_KEY", "MINIO_ACCESS_KEY"),
];

/// Whether a domain is still the unset default
pub fn is_placeholder_domain(domain: &str) -> bool {
    let domain = domain.trim();
    domain.is_empty() || domain == PLACEHOLDER_DOMAIN || domain == PLACEHOLDER_API_DOMAIN
}

/// Result of parsing a `.env` document
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EnvFile {
    pub values: BTreeMap<String, String>,

    /// 1-based numbers of lines that were not `KEY=VALUE`
    pub invalid_lines: Vec<usize>,
}

/// Parse `KEY=VALUE` lines
pub fn parse_env(contents: &str) -> EnvFile {
    let mut env = EnvFile::default();

    for (index, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            env.invalid_lines.push(index + 1);
            continue;
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            env.invalid_lines.push(index + 1);
            continue;
        }

        env.values.insert(key.to_string(), parse_value(value.trim()).to_string());
    }

    env
}

fn parse_value(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(rest) = value.strip_prefix(quote) {
            if let Some(end) = rest.find(quote) {
                // Only a comment may follow the closing quote
                let tail = rest[end + 1..].trim_start();
                if tail.is_empty() || tail.starts_with('#') {
                    return &rest[..end];
                }
            }
        }
    }
    // Unquoted values may carry a trailing comment
    match value.find(" #") {
        Some(pos) => value[..pos].trim_end(),
        None => value,
    }
}

fn parse_port(values: &BTreeMap<String, String>, key: &str) -> Result<u16, DeployError> {
    let raw = values.get(key).map(String::as_str).unwrap_or_default();
    raw.trim()
        .parse()
        .map_err(|_| DeployError::ConfigError(format!("{} must be a port number, got '{}'", key, raw)))
}

/// Deployment configuration for one run
#[derive(Debug)]
pub struct DeploySettings {
    /// Public site domain
    pub domain: String,

    /// Backend API domain
    pub api_domain: String,

    /// Contact email for the certificate authority
    pub ssl_email: String,

    pub frontend_port: u16,
    pub backend_port: u16,
    pub minio_console_port: u16,

    /// Base URL the frontend uses to reach the API
    pub public_api_url: String,

    /// Path probed on the backend after start
    pub backend_health_path: String,

    /// Compose project name (also the image name prefix)
    pub compose_project: String,

    values: BTreeMap<String, String>,
    secrets: BTreeMap<String, SecretString>,
}

impl DeploySettings {
    /// Build settings from raw key/value pairs, applying defaults and
    /// computing derived keys
    pub fn from_values(
        mut values: BTreeMap<String, String>,
    ) -> Result<(Self, Vec<Outcome>), DeployError> {
        let mut outcomes = Vec::new();

        for (key, default) in DEFAULTS {
            let unset = values.get(key).map(|v| v.trim().is_empty()).unwrap_or(true);
            if unset {
                values.insert(key.to_string(), default.to_string());
            }
        }

        let domain = values["DOMAIN"].trim().to_string();
        let api_domain = values["API_DOMAIN"].trim().to_string();
        let frontend_port = parse_port(&values, "FRONTEND_PORT")?;
        let backend_port = parse_port(&values, "BACKEND_PORT")?;
        let minio_console_port = parse_port(&values, "MINIO_CONSOLE_PORT")?;

        let public_api_url = match values.get("PUBLIC_API_URL").filter(|v| !v.trim().is_empty()) {
            Some(url) => {
                Url::parse(url.trim()).map_err(|e| {
                    DeployError::ConfigError(format!("PUBLIC_API_URL '{}' is not a valid URL: {}", url, e))
                })?;
                url.trim().to_string()
            }
            None if !is_placeholder_domain(&api_domain) => format!("https://{}", api_domain),
            None => format!("http://localhost:{}", backend_port),
        };
        values.insert("PUBLIC_API_URL".to_string(), public_api_url.clone());

        let mut secrets = BTreeMap::new();
        for key in SECRET_KEYS {
            match values.remove(key).filter(|v| !v.is_empty()) {
                Some(value) => {
                    secrets.insert(key.to_string(), SecretString::from(value));
                }
                None => {
                    warn!("{} is not set", key);
                    outcomes.push(Outcome::warning(format!("{} is not set", key)));
                }
            }
        }

        for (first, second) in SECRET_PAIRS {
            if let (Some(a), Some(b)) = (secrets.get(first), secrets.get(second)) {
                if a.expose_secret() == b.expose_secret() {
                    warn!("{} and {} hold the same value", first, second);
                    outcomes.push(Outcome::warning(format!(
                        "{} and {} should hold different values",
                        first, second
                    )));
                }
            }
        }

        let settings = Self {
            ssl_email: values["SSL_EMAIL"].trim().to_string(),
            backend_health_path: values["BACKEND_HEALTH_PATH"].trim().to_string(),
            compose_project: values["COMPOSE_PROJECT_NAME"].trim().to_string(),
            domain,
            api_domain,
            frontend_port,
            backend_port,
            minio_console_port,
            public_api_url,
            values,
            secrets,
        };

        Ok((settings, outcomes))
    }

    /// True only when neither domain is a placeholder
    pub fn ssl_enabled(&self) -> bool {
        !is_placeholder_domain(&self.domain) && !is_placeholder_domain(&self.api_domain)
    }

    /// Site domain first, API domain second
    pub fn domains(&self) -> Vec<String> {
        vec![self.domain.clone(), self.api_domain.clone()]
    }

    /// Non-secret setting by key, after defaults and derivation
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Secret setting by key
    pub fn secret(&self, key: &str) -> Option<&SecretString> {
        self.secrets.get(key)
    }

    /// Every setting, secrets included, for the compose child process
    pub fn compose_env(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(
                self.secrets
                    .iter()
                    .map(|(k, v)| (k.clone(), v.expose_secret().to_string())),
            )
            .collect()
    }
}

/// Load the deployment configuration, creating it from the template on
/// first run
pub async fn load_settings(
    layout: &StorageLayout,
    confirm: &dyn Confirm,
) -> Result<(DeploySettings, Vec<Outcome>), DeployError> {
    let env_file = layout.env_file();
    let mut outcomes = Vec::new();

    if !env_file.exists().await {
        let template = layout.env_template();
        if !template.exists().await {
            return Err(DeployError::TemplateMissing(template.path().to_path_buf()));
        }

        template.copy_to(&env_file).await?;
        env_file.set_permissions_600().await?;
        info!("Created {} from {}", env_file.path().display(), template.path().display());

        let prompt = format!(
            "Created {}. Set your domains, email and secrets there, then press Enter to continue (or type 'n' to abort): ",
            env_file.path().display()
        );
        if !confirm.confirm(&prompt).await? {
            return Err(DeployError::Aborted(format!(
                "{} was created but not confirmed",
                env_file.path().display()
            )));
        }
        outcomes.push(Outcome::ok(format!(
            "created {} from template",
            env_file.path().display()
        )));
    }

    let parsed = parse_env(&env_file.read_string().await?);
    for line in &parsed.invalid_lines {
        warn!("Ignoring malformed line {} in {}", line, env_file.path().display());
        outcomes.push(Outcome::warning(format!(
            "ignored malformed line {} in {}",
            line,
            env_file.path().display()
        )));
    }

    let count = parsed.values.len();
    let (settings, findings) = DeploySettings::from_values(parsed.values)?;
    outcomes.extend(findings);
    outcomes.push(Outcome::ok(format!(
        "loaded {} settings from {}",
        count,
        env_file.path().display()
    )));

    Ok((settings, outcomes))
}
