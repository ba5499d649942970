//! Deployment driver
//!
//! Walks the stages of [`DeploymentFsm`] in order, collecting the outcomes of
//! every step. The first fatal error fails the current stage and ends the run.

use chrono::Utc;
use colored::Colorize;
use serde::Serialize;
use tracing::{error, info, warn};
use url::Url;

use crate::app::options::{DeployOptions, Overrides};
use crate::app::prompt::Confirm;
use crate::deploy::certs::provision_certificates;
use crate::deploy::compose::{start_services, ComposeCli};
use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentState, Stage};
use crate::deploy::git::sync_repositories;
use crate::deploy::health::{probe_endpoints, HealthEndpoint};
use crate::deploy::outcome::{Outcome, Severity};
use crate::deploy::proxy::{configure_proxy, ProxyParams, SiteSpec};
use crate::errors::DeployError;
use crate::infra::command::CommandRunner;
use crate::installer::install::ensure_dependencies;
use crate::storage::settings::{load_settings, parse_env, DeploySettings};

/// Outcomes reported by one stage
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub outcomes: Vec<Outcome>,
}

/// A URL the operator can open once the stack is up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessUrl {
    pub label: String,
    pub url: String,
}

/// Result of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub state: DeploymentState,
    pub error: Option<String>,
    pub stages: Vec<StageRecord>,
    pub access_urls: Vec<AccessUrl>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == DeploymentState::Succeeded
    }

    /// Outcomes of a stage, empty if the stage never ran
    pub fn outcomes(&self, stage: Stage) -> &[Outcome] {
        self.stages
            .iter()
            .find(|record| record.stage == stage)
            .map(|record| record.outcomes.as_slice())
            .unwrap_or_default()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Outcome> {
        self.stages
            .iter()
            .flat_map(|record| record.outcomes.iter())
            .filter(|outcome| outcome.is_warning())
    }

    /// Operator-facing summary on stdout
    pub fn print_summary(&self) {
        println!();
        for record in &self.stages {
            println!("{}", record.stage.title().bold());
            for outcome in &record.outcomes {
                let tag = match outcome.severity {
                    Severity::Ok => "  ok   ".green(),
                    Severity::Skipped => "  skip ".dimmed(),
                    Severity::Warning => "  warn ".yellow(),
                    Severity::Fatal => "  FAIL ".red().bold(),
                };
                println!("{}{}", tag, outcome.message);
            }
        }
        println!();

        match (&self.state, &self.error) {
            (DeploymentState::Succeeded, _) => {
                let warnings = self.warnings().count();
                if warnings == 0 {
                    println!("{}", "Deployment complete".green().bold());
                } else {
                    println!(
                        "{} ({} warnings)",
                        "Deployment complete".green().bold(),
                        warnings
                    );
                }
                for access in &self.access_urls {
                    println!("  {:<14} {}", format!("{}:", access.label), access.url.as_str().cyan());
                }
            }
            (DeploymentState::Failed(stage), error) => {
                println!(
                    "{} during '{}': {}",
                    "Deployment failed".red().bold(),
                    stage.title(),
                    error.as_deref().unwrap_or("unknown error")
                );
            }
            (state, _) => println!("Deployment stopped in state {:?}", state),
        }
    }
}

struct Deployment {
    fsm: DeploymentFsm,
    stages: Vec<StageRecord>,
}

impl Deployment {
    fn new() -> Self {
        Self {
            fsm: DeploymentFsm::new(),
            stages: Vec::new(),
        }
    }

    fn process(&mut self, event: DeploymentEvent) -> Result<(), DeployError> {
        self.fsm.process(event).map_err(DeployError::TransitionError)?;
        if let Some(stage) = self.fsm.current_stage() {
            info!("==> {}", stage.title());
        }
        Ok(())
    }

    fn current(&self) -> Result<Stage, DeployError> {
        self.fsm.current_stage().ok_or_else(|| {
            DeployError::TransitionError(format!("No stage in progress ({:?})", self.fsm.state()))
        })
    }

    /// Record the outcomes of the current stage and move on
    fn complete(&mut self, outcomes: Vec<Outcome>) -> Result<(), DeployError> {
        let stage = self.current()?;
        for outcome in outcomes.iter().filter(|o| o.is_warning()) {
            warn!("[{:?}] {}", stage, outcome.message);
        }
        self.stages.push(StageRecord { stage, outcomes });
        self.process(DeploymentEvent::Advance)
    }

    fn fail(mut self, err: DeployError) -> RunReport {
        let message = err.to_string();
        error!("{}", message);

        let stage = self.fsm.current_stage().unwrap_or(Stage::ORDER[0]);
        self.stages.push(StageRecord {
            stage,
            outcomes: vec![Outcome::fatal(message.clone())],
        });
        if let Err(e) = self.fsm.process(DeploymentEvent::Fail(message)) {
            error!("{}", e);
        }
        self.report(Vec::new())
    }

    fn report(self, access_urls: Vec<AccessUrl>) -> RunReport {
        RunReport {
            state: self.fsm.state().clone(),
            error: self.fsm.error().map(str::to_string),
            stages: self.stages,
            access_urls,
        }
    }
}

/// Run every deployment stage once, in order
pub async fn run(
    options: &DeployOptions,
    overrides: &Overrides,
    runner: &dyn CommandRunner,
    confirm: &dyn Confirm,
) -> RunReport {
    let mut deployment = Deployment::new();
    match execute(&mut deployment, options, overrides, runner, confirm).await {
        Ok(access_urls) => {
            info!("Deployment complete");
            deployment.report(access_urls)
        }
        Err(e) => deployment.fail(e),
    }
}

async fn execute(
    deployment: &mut Deployment,
    options: &DeployOptions,
    overrides: &Overrides,
    runner: &dyn CommandRunner,
    confirm: &dyn Confirm,
) -> Result<Vec<AccessUrl>, DeployError> {
    deployment.process(DeploymentEvent::Start)?;

    let outcomes = ensure_dependencies(runner, &options.tools, &options.os_release_file).await?;
    deployment.complete(outcomes)?;

    let outcomes = synchronize(options, overrides, runner).await?;
    deployment.complete(outcomes)?;

    let (settings, outcomes) = load_settings(&options.layout, confirm).await?;
    deployment.complete(outcomes)?;

    let outcomes = if settings.ssl_enabled() {
        provision_certificates(
            runner,
            &options.certs,
            &settings.domains(),
            &settings.ssl_email,
            Utc::now(),
        )
        .await?
    } else {
        vec![Outcome::warning(
            "DOMAIN or API_DOMAIN is a placeholder; skipping certificates and serving plain HTTP",
        )]
    };
    deployment.complete(outcomes)?;

    let outcomes = configure_proxy(
        runner,
        &options.proxy,
        &options.certs,
        &site_specs(options, &settings),
        &ProxyParams {
            use_ssl: settings.ssl_enabled(),
            frontend_port: settings.frontend_port,
            backend_port: settings.backend_port,
        },
        Utc::now(),
    )
    .await?;
    deployment.complete(outcomes)?;

    let compose = ComposeCli::detect(
        runner,
        &options.layout.base_dir,
        settings.compose_project.clone(),
        settings.compose_env(),
    )
    .await?;
    let outcomes = start_services(
        runner,
        &compose,
        overrides.force_rebuild,
        options.settle_interval,
    )
    .await?;
    deployment.complete(outcomes)?;

    let outcomes = probe_endpoints(&health_endpoints(&settings)?, options.health_timeout).await;
    deployment.complete(outcomes)?;

    Ok(access_urls(&settings))
}

async fn synchronize(
    options: &DeployOptions,
    overrides: &Overrides,
    runner: &dyn CommandRunner,
) -> Result<Vec<Outcome>, DeployError> {
    let env_file = options.layout.env_file();
    let overrides = if env_file.exists().await {
        overrides.clone().or_values(&parse_env(&env_file.read_string().await?).values)
    } else {
        overrides.clone()
    };

    let repositories = overrides.repositories(&options.layout)?;
    sync_repositories(runner, &repositories, overrides.sync_action()?).await
}

/// Site and API proxy definitions
pub fn site_specs(options: &DeployOptions, settings: &DeploySettings) -> Vec<SiteSpec> {
    let templates = options.layout.templates_dir();
    vec![
        SiteSpec {
            name: format!("{}-app.conf", settings.compose_project),
            template: templates.file("app.conf.j2").path().to_path_buf(),
            domain: settings.domain.clone(),
            companion_domain: settings.api_domain.clone(),
        },
        SiteSpec {
            name: format!("{}-api.conf", settings.compose_project),
            template: templates.file("api.conf.j2").path().to_path_buf(),
            domain: settings.api_domain.clone(),
            companion_domain: settings.domain.clone(),
        },
    ]
}

/// Backend health path and frontend root on localhost
pub fn health_endpoints(settings: &DeploySettings) -> Result<Vec<HealthEndpoint>, DeployError> {
    let path = if settings.backend_health_path.starts_with('/') {
        settings.backend_health_path.clone()
    } else {
        format!("/{}", settings.backend_health_path)
    };
    let parse = |raw: String| {
        Url::parse(&raw)
            .map_err(|e| DeployError::ConfigError(format!("Invalid health URL {}: {}", raw, e)))
    };

    Ok(vec![
        HealthEndpoint {
            name: "backend".to_string(),
            url: parse(format!("http://localhost:{}{}", settings.backend_port, path))?,
        },
        HealthEndpoint {
            name: "frontend".to_string(),
            url: parse(format!("http://localhost:{}/", settings.frontend_port))?,
        },
    ])
}

/// Public URLs when SSL is on, localhost ports otherwise
pub fn access_urls(settings: &DeploySettings) -> Vec<AccessUrl> {
    let entry = |label: &str, url: String| AccessUrl {
        label: label.to_string(),
        url,
    };

    let mut urls = if settings.ssl_enabled() {
        vec![
            entry("Frontend", format!("https://{}", settings.domain)),
            entry("API", format!("https://{}", settings.api_domain)),
        ]
    } else {
        vec![
            entry("Frontend", format!("http://localhost:{}", settings.frontend_port)),
            entry("API", format!("http://localhost:{}", settings.backend_port)),
        ]
    };
    urls.push(entry(
        "MinIO console",
        format!("http://localhost:{}", settings.minio_console_port),
    ));
    urls
}
