//! Certificate provisioner tests

use std::path::Path;

use chrono::Utc;

use stackup::deploy::certs::{provision_certificates, CertOptions};
use stackup::deploy::outcome::Severity;
use stackup::errors::DeployError;
use stackup::infra::command::CommandOutput;

use crate::support::{enddate, ScriptedRunner};

fn options(root: &Path) -> CertOptions {
    CertOptions {
        live_dir: root.join("letsencrypt/live"),
        renewal_job: root.join("cron.d/stackup-certbot-renew"),
        dns_check: false,
        ..Default::default()
    }
}

fn domains() -> Vec<String> {
    vec!["shop.example.org".to_string()]
}

#[tokio::test]
async fn test_valid_certificate_is_left_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = options(tmp.path());
    let runner = ScriptedRunner::new(tmp.path()).on("openssl x509", CommandOutput::ok(enddate(60)));

    let outcomes = provision_certificates(&runner, &opts, &domains(), "ops@example.org", Utc::now())
        .await
        .unwrap();

    assert_eq!(outcomes[0].severity, Severity::Skipped);
    assert!(!runner.ran("certbot"));
    assert!(!runner.ran("systemctl"));
}

#[tokio::test]
async fn test_expiring_certificate_is_renewed_once() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = options(tmp.path());
    let runner = ScriptedRunner::new(tmp.path()).on("openssl x509", CommandOutput::ok(enddate(10)));

    let outcomes = provision_certificates(&runner, &opts, &domains(), "ops@example.org", Utc::now())
        .await
        .unwrap();

    assert_eq!(outcomes[0].severity, Severity::Ok);
    assert_eq!(runner.count("certbot renew --cert-name shop.example.org"), 1);
    assert!(!runner.ran("certbot certonly"));
}

#[tokio::test]
async fn test_failed_renewal_is_a_warning_and_not_retried() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = options(tmp.path());
    let runner = ScriptedRunner::new(tmp.path())
        .on("openssl x509", CommandOutput::ok(enddate(5)))
        .on("certbot renew", CommandOutput::failed(1, "Challenge failed"));

    let outcomes = provision_certificates(&runner, &opts, &domains(), "ops@example.org", Utc::now())
        .await
        .unwrap();

    assert_eq!(outcomes[0].severity, Severity::Warning);
    assert_eq!(runner.count("certbot"), 1);
}

#[tokio::test]
async fn test_unreadable_expiry_triggers_renewal() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = options(tmp.path());
    let runner = ScriptedRunner::new(tmp.path())
        .on("openssl x509", CommandOutput::failed(1, "unable to load certificate"));

    provision_certificates(&runner, &opts, &domains(), "ops@example.org", Utc::now())
        .await
        .unwrap();

    assert_eq!(runner.count("certbot renew"), 1);
}

#[tokio::test]
async fn test_missing_certificate_is_issued_around_proxy_stop() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = options(tmp.path());
    let runner = ScriptedRunner::new(tmp.path()).on("test -f", CommandOutput::failed(1, ""));

    let outcomes = provision_certificates(&runner, &opts, &domains(), "ops@example.org", Utc::now())
        .await
        .unwrap();

    let stop = runner.position("systemctl stop nginx").unwrap();
    let issue = runner.position("certbot certonly --standalone").unwrap();
    let start = runner.position("systemctl start nginx").unwrap();
    assert!(stop < issue && issue < start);
    assert!(runner.ran("certbot certonly --standalone --preferred-challenges http --http-01-port 80 -d shop.example.org --email ops@example.org"));
    assert!(outcomes.iter().any(|o| o.message.contains("certificate issued")));
}

#[tokio::test]
async fn test_inactive_proxy_is_not_touched_during_issuance() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = options(tmp.path());
    let runner = ScriptedRunner::new(tmp.path())
        .on("test -f", CommandOutput::failed(1, ""))
        .on("systemctl is-active", CommandOutput::failed(3, ""));

    provision_certificates(&runner, &opts, &domains(), "ops@example.org", Utc::now())
        .await
        .unwrap();

    assert!(!runner.ran("systemctl stop"));
    assert!(!runner.ran("systemctl start"));
}

#[tokio::test]
async fn test_failed_issuance_restarts_proxy_then_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = options(tmp.path());
    let runner = ScriptedRunner::new(tmp.path())
        .on("test -f", CommandOutput::failed(1, ""))
        .on("certbot certonly", CommandOutput::failed(1, "Timeout during connect"));

    let err = provision_certificates(&runner, &opts, &domains(), "ops@example.org", Utc::now())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::CertificateError(_)));
    assert_eq!(runner.count("certbot certonly"), 1);
    assert!(runner.position("systemctl start nginx").unwrap() > runner.position("certbot certonly").unwrap());
}

#[tokio::test]
async fn test_placeholder_domains_are_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = options(tmp.path());
    let runner = ScriptedRunner::new(tmp.path());
    let domains = vec!["your-domain.com".to_string(), "api.your-domain.com".to_string()];

    let outcomes = provision_certificates(&runner, &opts, &domains, "admin@your-domain.com", Utc::now())
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].severity, Severity::Warning);
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_renewal_job_is_installed() {
    let tmp = tempfile::tempdir().unwrap();
    let opts = options(tmp.path());
    let runner = ScriptedRunner::new(tmp.path()).on("openssl x509", CommandOutput::ok(enddate(80)));

    let outcomes = provision_certificates(&runner, &opts, &domains(), "ops@example.org", Utc::now())
        .await
        .unwrap();

    let job = std::fs::read_to_string(&opts.renewal_job).unwrap();
    assert!(job.contains("certbot renew"));
    assert!(job.starts_with("# Managed by stackup"));
    assert_eq!(outcomes.last().unwrap().severity, Severity::Ok);
}
