//! Reverse proxy configuration
//!
//! Site files are rendered from templates into a scratch directory, installed
//! next to backups of whatever they replace, and validated with `nginx -t`.
//! A failed validation puts the previous files back, so the live proxy keeps
//! serving its old configuration.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tera::{Context, Tera};
use tracing::{debug, error, info, warn};

use crate::deploy::certs::CertOptions;
use crate::deploy::outcome::Outcome;
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::infra::command::{Cmd, CommandRunner};

/// Where the proxy keeps its site configuration
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub sites_available: PathBuf,
    pub sites_enabled: PathBuf,

    /// Catch-all site shipped with the distribution package
    pub default_site: PathBuf,

    /// Service name
    pub service: String,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            sites_available: PathBuf::from("/etc/nginx/sites-available"),
            sites_enabled: PathBuf::from("/etc/nginx/sites-enabled"),
            default_site: PathBuf::from("/etc/nginx/sites-enabled/default"),
            service: "nginx".to_string(),
        }
    }
}

/// One proxied site
#[derive(Debug, Clone)]
pub struct SiteSpec {
    /// Installed file name
    pub name: String,

    /// Template to render
    pub template: PathBuf,

    /// Domain this site serves
    pub domain: String,

    /// The other site's domain (CORS origins, redirects)
    pub companion_domain: String,
}

/// Parameters shared by every site
#[derive(Debug, Clone, Copy)]
pub struct ProxyParams {
    pub use_ssl: bool,
    pub frontend_port: u16,
    pub backend_port: u16,
}

fn site_context(site: &SiteSpec, params: &ProxyParams, certs: &CertOptions) -> Context {
    let mut context = Context::new();
    context.insert("domain", &site.domain);
    context.insert("companion_domain", &site.companion_domain);
    context.insert("use_ssl", &params.use_ssl);
    context.insert("frontend_port", &params.frontend_port);
    context.insert("backend_port", &params.backend_port);

    if params.use_ssl {
        let path = |p: PathBuf| p.display().to_string();
        context.insert("ssl_certificate", &path(certs.fullchain(&site.domain)));
        context.insert("ssl_certificate_key", &path(certs.privkey(&site.domain)));
        context.insert(
            "companion_ssl_certificate",
            &path(certs.fullchain(&site.companion_domain)),
        );
        context.insert(
            "companion_ssl_certificate_key",
            &path(certs.privkey(&site.companion_domain)),
        );
    }
    context
}

/// Render one site template
pub fn render_site(
    source: &str,
    site: &SiteSpec,
    params: &ProxyParams,
    certs: &CertOptions,
) -> Result<String, DeployError> {
    let mut tera = Tera::default();
    tera.add_raw_template(&site.name, source)?;
    Ok(tera.render(&site.name, &site_context(site, params, certs))?)
}

/// A site file put in place during this run
struct Installed {
    target: File,
    link: File,
    backup: Option<File>,
    link_existed: bool,
}

fn path_arg(file: &File) -> String {
    file.path().to_string_lossy().into_owned()
}

async fn render_all(
    staging: &Dir,
    sites: &[SiteSpec],
    params: &ProxyParams,
    certs: &CertOptions,
) -> Result<Vec<File>, DeployError> {
    let mut rendered = Vec::with_capacity(sites.len());
    for site in sites {
        let template = File::new(&site.template);
        if !template.exists().await {
            return Err(DeployError::TemplateMissing(site.template.clone()));
        }

        let contents = render_site(&template.read_string().await?, site, params, certs)?;
        let file = staging.file(&site.name);
        file.write_string(&contents).await?;
        debug!("Rendered {} to {}", site.name, file.path().display());
        rendered.push(file);
    }
    Ok(rendered)
}

async fn install_all(
    runner: &dyn CommandRunner,
    options: &ProxyOptions,
    sites: &[SiteSpec],
    rendered: &[File],
    suffix: &str,
    installed: &mut Vec<Installed>,
) -> Result<(), DeployError> {
    for (site, file) in sites.iter().zip(rendered) {
        let target = File::new(options.sites_available.join(&site.name));
        let link = File::new(options.sites_enabled.join(&site.name));

        let backup = if target.is_present().await {
            let backup = File::new(format!("{}.bak.{}", target.path().display(), suffix));
            let copy = Cmd::new("cp")
                .arg("-p")
                .arg(path_arg(&target))
                .arg(path_arg(&backup))
                .elevated();
            runner.run_checked(&copy).await?;
            info!("Backed up {} to {}", target.path().display(), backup.path().display());
            Some(backup)
        } else {
            None
        };
        let link_existed = link.is_present().await;

        installed.push(Installed {
            target: target.clone(),
            link: link.clone(),
            backup,
            link_existed,
        });

        let install = Cmd::new("install")
            .args(["-m", "644"])
            .arg(path_arg(file))
            .arg(path_arg(&target))
            .elevated();
        runner.run_checked(&install).await?;

        let enable = Cmd::new("ln")
            .arg("-sf")
            .arg(path_arg(&target))
            .arg(path_arg(&link))
            .elevated();
        runner.run_checked(&enable).await?;
    }
    Ok(())
}

async fn validate(runner: &dyn CommandRunner) -> Result<(), DeployError> {
    let output = runner.run(&Cmd::new("nginx").arg("-t").elevated()).await?;
    if output.success {
        return Ok(());
    }
    Err(DeployError::ProxyError(format!(
        "configuration test failed: {}",
        output.stderr_summary()
    )))
}

async fn rollback(runner: &dyn CommandRunner, installed: &[Installed]) {
    for item in installed.iter().rev() {
        let restore = match &item.backup {
            Some(backup) => Cmd::new("cp").arg("-p").arg(path_arg(backup)).arg(path_arg(&item.target)),
            None => Cmd::new("rm").arg("-f").arg(path_arg(&item.target)),
        };
        if let Err(e) = runner.run_checked(&restore.elevated()).await {
            error!("Rollback of {} failed: {}", item.target.path().display(), e);
        }

        if !item.link_existed {
            let unlink = Cmd::new("rm").arg("-f").arg(path_arg(&item.link)).elevated();
            if let Err(e) = runner.run_checked(&unlink).await {
                error!("Rollback of {} failed: {}", item.link.path().display(), e);
            }
        }
    }
}

async fn reload_or_start(runner: &dyn CommandRunner, service: &str) -> Result<Outcome, DeployError> {
    let active = runner
        .probe(&Cmd::new("systemctl").args(["is-active", "--quiet", service]).elevated())
        .await;

    let commands: Vec<Cmd> = if active {
        vec![Cmd::new("systemctl").args(["reload", service]).elevated()]
    } else {
        vec![
            Cmd::new("systemctl").args(["start", service]).elevated(),
            Cmd::new("systemctl").args(["enable", service]).elevated(),
        ]
    };
    for cmd in &commands {
        runner
            .run_checked(cmd)
            .await
            .map_err(|e| DeployError::ProxyError(format!("Failed to apply configuration: {}", e)))?;
    }

    Ok(if active {
        Outcome::ok(format!("{} reloaded", service))
    } else {
        Outcome::ok(format!("{} started and enabled", service))
    })
}

/// Render, install, validate and activate the proxy configuration
pub async fn configure_proxy(
    runner: &dyn CommandRunner,
    options: &ProxyOptions,
    certs: &CertOptions,
    sites: &[SiteSpec],
    params: &ProxyParams,
    now: DateTime<Utc>,
) -> Result<Vec<Outcome>, DeployError> {
    info!(
        "Configuring {} for {} sites (ssl: {})",
        options.service,
        sites.len(),
        params.use_ssl
    );

    let staging = Dir::create_temp_dir("stackup-nginx").await?;
    let rendered = match render_all(&staging, sites, params, certs).await {
        Ok(rendered) => rendered,
        Err(e) => {
            staging.delete().await?;
            return Err(e);
        }
    };

    let suffix = now.format("%Y%m%d%H%M%S").to_string();
    let mut installed = Vec::new();
    let applied = match install_all(runner, options, sites, &rendered, &suffix, &mut installed).await {
        Ok(()) => validate(runner).await,
        Err(e) => Err(e),
    };
    if let Err(e) = applied {
        warn!("Restoring previous {} configuration", options.service);
        rollback(runner, &installed).await;
        return Err(DeployError::ProxyError(format!(
            "{}; generated files kept in {}",
            e,
            staging.path().display()
        )));
    }

    let mut outcomes: Vec<Outcome> = sites
        .iter()
        .map(|site| Outcome::ok(format!("installed {} for {}", site.name, site.domain)))
        .collect();

    let default_site = File::new(&options.default_site);
    if default_site.is_present().await {
        runner
            .run_checked(&Cmd::new("rm").arg("-f").arg(path_arg(&default_site)).elevated())
            .await?;
        outcomes.push(Outcome::ok("removed default site"));
    }

    outcomes.push(reload_or_start(runner, &options.service).await?);
    staging.delete().await?;

    Ok(outcomes)
}
