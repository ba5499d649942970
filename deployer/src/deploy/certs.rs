//! TLS certificate provisioning
//!
//! Per domain the decision is issue, renew or skip, based on whether the
//! certificate file exists and how long it stays valid. First issuance uses
//! certbot's standalone listener, which needs the plaintext port, so a running
//! proxy is stopped for the duration and restarted on every exit path.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{debug, info, warn};

use crate::deploy::outcome::Outcome;
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::infra::command::{Cmd, CommandRunner};
use crate::storage::settings::is_placeholder_domain;

/// Certificates with less validity left than this are renewed
pub const RENEWAL_WINDOW_DAYS: i64 = 30;

/// Certificate provisioning options
#[derive(Debug, Clone)]
pub struct CertOptions {
    /// certbot's `live` directory
    pub live_dir: PathBuf,

    /// Service name of the reverse proxy
    pub proxy_service: String,

    /// Port used for the HTTP-01 challenge
    pub http_port: u16,

    /// Renew when less than this much validity remains
    pub renewal_window: chrono::Duration,

    /// Compare DNS answers against the host's public address before issuing
    pub dns_check: bool,

    /// Plain-text "what is my IP" endpoints, tried in order
    pub public_ip_urls: Vec<String>,

    /// Scheduled job that renews every certificate
    pub renewal_job: PathBuf,

    /// Cron schedule for the renewal job
    pub renewal_schedule: String,
}

impl Default for CertOptions {
    fn default() -> Self {
        Self {
            live_dir: PathBuf::from("/etc/letsencrypt/live"),
            proxy_service: "nginx".to_string(),
            http_port: 80,
            renewal_window: chrono::Duration::days(RENEWAL_WINDOW_DAYS),
            dns_check: true,
            public_ip_urls: vec![
                "https://api.ipify.org".to_string(),
                "https://ifconfig.me/ip".to_string(),
                "https://icanhazip.com".to_string(),
            ],
            renewal_job: PathBuf::from("/etc/cron.d/stackup-certbot-renew"),
            renewal_schedule: "17 3 * * *".to_string(),
        }
    }
}

impl CertOptions {
    /// Full chain certificate path for a domain
    pub fn fullchain(&self, domain: &str) -> PathBuf {
        self.live_dir.join(domain).join("fullchain.pem")
    }

    /// Private key path for a domain
    pub fn privkey(&self, domain: &str) -> PathBuf {
        self.live_dir.join(domain).join("privkey.pem")
    }
}

/// What to do for one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertAction {
    Issue,
    Renew,
    Skip,
}

/// Observed certificate state for a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRecord {
    pub domain: String,
    pub exists: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CertRecord {
    /// Validity left at `now`, if the expiry could be read
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.expires_at.map(|expires_at| expires_at - now)
    }

    /// Classify the record. An existing certificate whose expiry cannot be
    /// read is renewed.
    pub fn action(&self, now: DateTime<Utc>, window: chrono::Duration) -> CertAction {
        if !self.exists {
            return CertAction::Issue;
        }
        match self.remaining(now) {
            Some(remaining) if remaining >= window => CertAction::Skip,
            _ => CertAction::Renew,
        }
    }
}

/// Parse the `notAfter=` line printed by `openssl x509 -enddate`
pub fn parse_not_after(output: &str) -> Option<DateTime<Utc>> {
    let value = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("notAfter="))?;
    let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
    let timestamp = normalized.strip_suffix(" GMT").unwrap_or(&normalized);
    NaiveDateTime::parse_from_str(timestamp, "%b %d %H:%M:%S %Y")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Probe the certificate store for a domain
pub async fn inspect(
    runner: &dyn CommandRunner,
    options: &CertOptions,
    domain: &str,
) -> Result<CertRecord, DeployError> {
    let path = options.fullchain(domain);
    let path = path.to_string_lossy();

    // The letsencrypt tree is root-only
    let exists = runner
        .probe(&Cmd::new("test").args(["-f", &*path]).elevated())
        .await;
    if !exists {
        return Ok(CertRecord {
            domain: domain.to_string(),
            exists: false,
            expires_at: None,
        });
    }

    let output = runner
        .run(
            &Cmd::new("openssl")
                .args(["x509", "-enddate", "-noout", "-in", &*path])
                .elevated(),
        )
        .await?;
    let expires_at = if output.success {
        parse_not_after(&output.stdout)
    } else {
        None
    };
    debug!("Certificate for {} expires at {:?}", domain, expires_at);

    Ok(CertRecord {
        domain: domain.to_string(),
        exists: true,
        expires_at,
    })
}

fn systemctl(action: &str, service: &str) -> Cmd {
    Cmd::new("systemctl").args([action, service]).elevated()
}

/// Renew one certificate. Failure is a warning, never retried in this run.
async fn renew(runner: &dyn CommandRunner, options: &CertOptions, domain: &str) -> Outcome {
    info!("Renewing certificate for {}...", domain);
    let cmd = Cmd::new("certbot")
        .args(["renew", "--cert-name", domain, "--non-interactive"])
        .arg("--pre-hook")
        .arg(format!("systemctl stop {}", options.proxy_service))
        .arg("--post-hook")
        .arg(format!("systemctl start {}", options.proxy_service))
        .elevated()
        .interactive();

    match runner.run_checked(&cmd).await {
        Ok(_) => Outcome::ok(format!("{}: certificate renewed", domain)),
        Err(e) => {
            warn!("Renewal for {} failed: {}", domain, e);
            Outcome::warning(format!("{}: renewal failed, current certificate kept ({})", domain, e))
        }
    }
}

/// Issue a first certificate with the standalone challenge
async fn issue(
    runner: &dyn CommandRunner,
    options: &CertOptions,
    domain: &str,
    email: &str,
) -> Result<Vec<Outcome>, DeployError> {
    let mut outcomes = Vec::new();
    let service = options.proxy_service.as_str();

    let proxy_active = runner
        .probe(&Cmd::new("systemctl").args(["is-active", "--quiet", service]).elevated())
        .await;
    if proxy_active {
        info!("Stopping {} to free port {} for the challenge", service, options.http_port);
        runner
            .run_checked(&systemctl("stop", service))
            .await
            .map_err(|e| DeployError::CertificateError(format!("Failed to stop {}: {}", service, e)))?;
    }

    info!("Requesting certificate for {}...", domain);
    let certonly = Cmd::new("certbot")
        .args(["certonly", "--standalone", "--preferred-challenges", "http"])
        .arg("--http-01-port")
        .arg(options.http_port.to_string())
        .args(["-d", domain, "--email", email])
        .args(["--agree-tos", "--no-eff-email", "--non-interactive"])
        .elevated()
        .interactive();
    let issued = runner.run_checked(&certonly).await;

    // Restart whatever the issuance outcome was
    let mut restart_error = None;
    if proxy_active {
        info!("Restarting {}", service);
        if let Err(e) = runner.run_checked(&systemctl("start", service)).await {
            warn!("Failed to restart {}: {}", service, e);
            outcomes.push(Outcome::warning(format!("failed to restart {}: {}", service, e)));
            restart_error = Some(e);
        }
    }

    match issued {
        Ok(_) => {
            outcomes.push(Outcome::ok(format!("{}: certificate issued", domain)));
            Ok(outcomes)
        }
        Err(e) => {
            let mut message = format!("Failed to issue certificate for {}: {}", domain, e);
            if let Some(restart) = restart_error {
                message.push_str(&format!(" (and {} did not restart: {})", service, restart));
            }
            Err(DeployError::CertificateError(message))
        }
    }
}

async fn discover_public_ip(urls: &[String]) -> Option<IpAddr> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .ok()?;

    for url in urls {
        let response = match client.get(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!("{} answered {}", url, response.status());
                continue;
            }
            Err(e) => {
                debug!("{} unreachable: {}", url, e);
                continue;
            }
        };
        if let Ok(ip) = response.text().await.unwrap_or_default().trim().parse() {
            return Some(ip);
        }
    }
    None
}

/// Best-effort check that `domain` points at this host.
///
/// Never fails: DNS propagation delays are common.
pub async fn check_dns(options: &CertOptions, domain: &str) -> Outcome {
    let resolved: Vec<IpAddr> = match tokio::net::lookup_host((domain, options.http_port)).await {
        Ok(addrs) => addrs.map(|addr| addr.ip()).collect(),
        Err(e) => {
            warn!("Could not resolve {}: {}", domain, e);
            return Outcome::warning(format!("{}: DNS lookup failed ({})", domain, e));
        }
    };

    let Some(public_ip) = discover_public_ip(&options.public_ip_urls).await else {
        warn!("Could not determine this host's public address");
        return Outcome::warning(format!(
            "{}: could not determine this host's public address for the DNS check",
            domain
        ));
    };

    if resolved.contains(&public_ip) {
        Outcome::ok(format!("{}: resolves to this host ({})", domain, public_ip))
    } else {
        let resolved = resolved
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        warn!("{} resolves to [{}], this host is {}", domain, resolved, public_ip);
        Outcome::warning(format!(
            "{}: resolves to [{}] but this host is {}; issuance may fail until DNS propagates",
            domain, resolved, public_ip
        ))
    }
}

/// Contents of the scheduled renewal job
pub fn renewal_job_contents(options: &CertOptions) -> String {
    let service = &options.proxy_service;
    format!(
        "# Managed by stackup. Renews every certificate and reloads {service}.\n\
         SHELL=/bin/sh\n\
         PATH=/usr/local/sbin:/usr/local/bin:/sbin:/bin:/usr/sbin:/usr/bin\n\
         {schedule} root certbot renew --quiet --pre-hook \"systemctl stop {service}\" --post-hook \"systemctl start {service}\" && systemctl reload {service}\n",
        schedule = options.renewal_schedule,
    )
}

/// Install (or overwrite) the renewal job
pub async fn install_renewal_job(runner: &dyn CommandRunner, options: &CertOptions) -> Outcome {
    match write_renewal_job(runner, options).await {
        Ok(()) => Outcome::ok(format!(
            "renewal job installed at {}",
            options.renewal_job.display()
        )),
        Err(e) => {
            warn!("Failed to install renewal job: {}", e);
            Outcome::warning(format!("renewal job not installed: {}", e))
        }
    }
}

async fn write_renewal_job(runner: &dyn CommandRunner, options: &CertOptions) -> Result<(), DeployError> {
    let staging = Dir::create_temp_dir("stackup-cron").await?;
    let job = staging.file("certbot-renew");
    job.write_string(&renewal_job_contents(options)).await?;

    let result = runner
        .run_checked(
            &Cmd::new("install")
                .args(["-m", "644"])
                .arg(job.path().to_string_lossy())
                .arg(options.renewal_job.to_string_lossy())
                .elevated(),
        )
        .await;
    staging.delete().await?;
    result.map(|_| ())
}

/// Provision certificates for every non-placeholder domain
pub async fn provision_certificates(
    runner: &dyn CommandRunner,
    options: &CertOptions,
    domains: &[String],
    email: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Outcome>, DeployError> {
    let domains: Vec<&str> = domains
        .iter()
        .map(String::as_str)
        .filter(|domain| !is_placeholder_domain(domain))
        .collect();
    if domains.is_empty() {
        warn!("No real domains configured, skipping certificates");
        return Ok(vec![Outcome::warning(
            "domains are still placeholders; certificate provisioning skipped",
        )]);
    }

    let mut outcomes = Vec::new();
    for domain in domains {
        let record = inspect(runner, options, domain).await?;
        match record.action(now, options.renewal_window) {
            CertAction::Skip => {
                let days = record.remaining(now).map(|d| d.num_days()).unwrap_or_default();
                debug!("Certificate for {} valid for {} more days", domain, days);
                outcomes.push(Outcome::skipped(format!(
                    "{}: certificate valid for {} more days",
                    domain, days
                )));
            }
            CertAction::Renew => outcomes.push(renew(runner, options, domain).await),
            CertAction::Issue => {
                if options.dns_check {
                    outcomes.push(check_dns(options, domain).await);
                }
                outcomes.extend(issue(runner, options, domain, email).await?);
            }
        }
    }

    outcomes.push(install_renewal_job(runner, options).await);
    Ok(outcomes)
}
