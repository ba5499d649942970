//! End-to-end runs of the deployment driver against a scripted host

use std::path::PathBuf;
use std::time::Duration;

use stackup::app::options::{DeployOptions, Overrides};
use stackup::app::run::run;
use stackup::deploy::certs::CertOptions;
use stackup::deploy::fsm::{DeploymentState, Stage};
use stackup::deploy::proxy::ProxyOptions;
use stackup::infra::command::CommandOutput;
use stackup::storage::layout::StorageLayout;

use crate::support::{AutoConfirm, ScriptedRunner, DEBIAN_OS_RELEASE, PS_ALL_RUNNING};

const ENV_TEMPLATE: &str = include_str!("../../../.env.example");
const APP_TEMPLATE: &str = include_str!("../../../templates/nginx/app.conf.j2");
const API_TEMPLATE: &str = include_str!("../../../templates/nginx/api.conf.j2");

struct Host {
    tmp: tempfile::TempDir,
    options: DeployOptions,
}

impl Host {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let base = root.join("stack");

        std::fs::create_dir_all(base.join("templates/nginx")).unwrap();
        std::fs::write(base.join(".env.example"), ENV_TEMPLATE).unwrap();
        std::fs::write(base.join("templates/nginx/app.conf.j2"), APP_TEMPLATE).unwrap();
        std::fs::write(base.join("templates/nginx/api.conf.j2"), API_TEMPLATE).unwrap();
        std::fs::write(root.join("os-release"), DEBIAN_OS_RELEASE).unwrap();

        let proxy = ProxyOptions {
            sites_available: root.join("nginx/sites-available"),
            sites_enabled: root.join("nginx/sites-enabled"),
            default_site: root.join("nginx/sites-enabled/default"),
            ..Default::default()
        };
        std::fs::create_dir_all(&proxy.sites_available).unwrap();
        std::fs::create_dir_all(&proxy.sites_enabled).unwrap();
        std::fs::write(&proxy.default_site, "server { listen 80 default_server; }").unwrap();

        let options = DeployOptions {
            layout: StorageLayout::new(&base),
            proxy,
            certs: CertOptions {
                live_dir: root.join("letsencrypt/live"),
                renewal_job: root.join("cron.d/stackup-certbot-renew"),
                dns_check: false,
                ..Default::default()
            },
            os_release_file: root.join("os-release"),
            settle_interval: Duration::ZERO,
            health_timeout: Duration::from_millis(500),
            ..Default::default()
        };

        Self { tmp, options }
    }

    fn runner(&self) -> ScriptedRunner {
        ScriptedRunner::new(self.tmp.path())
            .on("docker compose -p stackup ps", CommandOutput::ok(PS_ALL_RUNNING))
    }

    fn write_env(&self, contents: &str) {
        std::fs::write(self.options.layout.base_dir.join(".env"), contents).unwrap();
    }

    fn site(&self, name: &str) -> PathBuf {
        self.options.proxy.sites_available.join(name)
    }
}

fn overrides() -> Overrides {
    Overrides {
        frontend_repo_url: Some("https://git.example.com/acme/frontend.git".to_string()),
        backend_repo_url: Some("https://git.example.com/acme/backend.git".to_string()),
        ..Default::default()
    }
}

const REAL_DOMAINS_ENV: &str = "\
DOMAIN=shop.example.org
API_DOMAIN=api.shop.example.org
SSL_EMAIL=ops@example.org
JWT_SECRET=first-secret
JWT_REFRESH_SECRET=second-secret
POSTGRES_PASSWORD=pg-password
MINIO_ACCESS_KEY=minio-access
MINIO_SECRET_KEY=minio-secret
";

#[tokio::test]
async fn test_first_run_creates_env_and_deploys() {
    let host = Host::new();
    let runner = host.runner();
    let confirm = AutoConfirm::yes();

    let report = run(&host.options, &overrides(), &runner, &confirm).await;

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.stages.len(), Stage::ORDER.len());
    assert_eq!(confirm.prompts().len(), 1);
    assert!(host.options.layout.base_dir.join(".env").exists());

    assert_eq!(runner.count("git clone"), 2);
    assert!(host.options.layout.base_dir.join("frontend/.git").is_dir());
    assert!(host.site("stackup-app.conf").exists());
    assert!(runner.ran("docker compose -p stackup up -d"));

    // Order of the stages on the host
    let clone = runner.position("git clone").unwrap();
    let validate = runner.position("nginx -t").unwrap();
    let up = runner.position("docker compose -p stackup up -d").unwrap();
    assert!(clone < validate && validate < up);

    assert_eq!(report.access_urls[0].url, "http://localhost:3000");
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let host = Host::new();
    let confirm = AutoConfirm::yes();
    let first = run(&host.options, &overrides(), &host.runner(), &confirm).await;
    assert!(first.is_success(), "{:?}", first.error);

    let runner = host.runner().on("docker images", CommandOutput::ok("3f2a9c1d7e55\n"));
    let second = run(&host.options, &overrides(), &runner, &confirm).await;

    assert!(second.is_success(), "{:?}", second.error);
    assert_eq!(confirm.prompts().len(), 1);
    assert!(!runner.ran("apt-get"));
    assert!(!runner.ran("git clone"));
    assert_eq!(runner.count("git fetch"), 2);
    assert!(!runner.ran("docker compose -p stackup build"));
}

#[tokio::test]
async fn test_placeholder_domains_skip_certificates() {
    let host = Host::new();
    host.write_env(ENV_TEMPLATE);
    let runner = host.runner();

    let report = run(&host.options, &overrides(), &runner, &AutoConfirm::yes()).await;

    assert!(report.is_success(), "{:?}", report.error);
    let certs = report.outcomes(Stage::Certificates);
    assert_eq!(certs.len(), 1);
    assert!(certs[0].is_warning());
    assert!(!runner.ran("certbot certonly"));
    assert!(!runner.ran("certbot renew"));
    assert!(!host.options.certs.renewal_job.exists());

    let app = std::fs::read_to_string(host.site("stackup-app.conf")).unwrap();
    assert!(!app.contains("ssl_certificate"));
    assert!(!app.contains("443"));
}

#[tokio::test]
async fn test_missing_proxy_template_aborts_before_changes() {
    let host = Host::new();
    host.write_env(ENV_TEMPLATE);
    std::fs::remove_file(host.options.layout.base_dir.join("templates/nginx/api.conf.j2")).unwrap();
    let runner = host.runner();

    let report = run(&host.options, &overrides(), &runner, &AutoConfirm::yes()).await;

    assert!(!report.is_success());
    assert_eq!(report.state, DeploymentState::Failed(Stage::Proxy));
    assert_eq!(
        std::fs::read_dir(&host.options.proxy.sites_available).unwrap().count(),
        0
    );
    assert!(host.options.proxy.default_site.exists());
    assert!(!runner.ran("nginx -t"));
    assert!(!runner.ran("docker compose -p"));
}

#[tokio::test]
async fn test_failed_issuance_restarts_proxy_and_fails() {
    let host = Host::new();
    host.write_env(REAL_DOMAINS_ENV);
    let runner = host
        .runner()
        .on("test -f", CommandOutput::failed(1, ""))
        .on("certbot certonly", CommandOutput::failed(1, "Timeout during connect (likely firewall problem)"));

    let report = run(&host.options, &overrides(), &runner, &AutoConfirm::yes()).await;

    assert_eq!(report.state, DeploymentState::Failed(Stage::Certificates));
    assert!(report.error.as_deref().unwrap().contains("shop.example.org"));

    let issue = runner.position("certbot certonly").unwrap();
    let restart = runner.position("systemctl start nginx").unwrap();
    assert!(issue < restart);
    assert_eq!(runner.count("certbot certonly"), 1);

    // Nothing after the failed stage ran
    assert!(!runner.ran("nginx -t"));
    assert!(!host.site("stackup-app.conf").exists());
}

#[tokio::test]
async fn test_real_domains_deploy_with_ssl() {
    let host = Host::new();
    host.write_env(REAL_DOMAINS_ENV);
    let runner = host.runner().on("test -f", CommandOutput::failed(1, ""));

    let report = run(&host.options, &overrides(), &runner, &AutoConfirm::yes()).await;

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(runner.count("certbot certonly"), 2);
    let app = std::fs::read_to_string(host.site("stackup-app.conf")).unwrap();
    assert!(app.contains("listen 443 ssl"));
    assert_eq!(report.access_urls[0].url, "https://shop.example.org");
}

#[tokio::test]
async fn test_declined_env_confirmation_stops_the_run() {
    let host = Host::new();
    let runner = host.runner();

    let report = run(&host.options, &overrides(), &runner, &AutoConfirm::no()).await;

    assert_eq!(report.state, DeploymentState::Failed(Stage::Environment));
    assert!(!runner.ran("nginx -t"));
    assert!(!runner.ran("docker compose -p"));
}

#[tokio::test]
async fn test_no_running_service_fails_the_run() {
    let host = Host::new();
    host.write_env(ENV_TEMPLATE);
    let runner = host.runner().on("docker compose -p stackup ps", CommandOutput::ok(""));

    let report = run(&host.options, &overrides(), &runner, &AutoConfirm::yes()).await;

    assert_eq!(report.state, DeploymentState::Failed(Stage::Containers));
    assert!(report.outcomes(Stage::HealthChecks).is_empty());
}

#[tokio::test]
async fn test_repo_settings_fall_back_to_env_file() {
    let host = Host::new();
    host.write_env(ENV_TEMPLATE);
    let runner = host.runner();

    let report = run(&host.options, &Overrides::default(), &runner, &AutoConfirm::yes()).await;

    assert!(report.is_success(), "{:?}", report.error);
    assert!(runner.ran("git clone -b main https://github.com/your-org/frontend.git"));
}
