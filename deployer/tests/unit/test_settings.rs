//! Environment loader tests

use std::os::unix::fs::PermissionsExt;

use stackup::errors::DeployError;
use stackup::storage::layout::StorageLayout;
use stackup::storage::settings::load_settings;

use crate::support::AutoConfirm;

const TEMPLATE: &str = include_str!("../../../.env.example");

#[tokio::test]
async fn test_first_run_creates_env_from_template() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join(".env.example"), TEMPLATE).unwrap();
    let layout = StorageLayout::new(tmp.path());
    let confirm = AutoConfirm::yes();

    let (settings, outcomes) = load_settings(&layout, &confirm).await.unwrap();

    let env_file = tmp.path().join(".env");
    assert_eq!(std::fs::read_to_string(&env_file).unwrap(), TEMPLATE);
    let mode = std::fs::metadata(&env_file).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    assert_eq!(confirm.prompts().len(), 1);
    assert!(confirm.prompts()[0].contains(".env"));
    assert!(outcomes[0].message.contains("created"));
    assert!(!settings.ssl_enabled());
}

#[tokio::test]
async fn test_declined_confirmation_aborts() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join(".env.example"), TEMPLATE).unwrap();
    let layout = StorageLayout::new(tmp.path());

    let err = load_settings(&layout, &AutoConfirm::no()).await.unwrap_err();
    assert!(matches!(err, DeployError::Aborted(_)));
}

#[tokio::test]
async fn test_missing_template_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = StorageLayout::new(tmp.path());
    let confirm = AutoConfirm::yes();

    let err = load_settings(&layout, &confirm).await.unwrap_err();

    assert!(matches!(err, DeployError::TemplateMissing(_)));
    assert!(confirm.prompts().is_empty());
    assert!(!tmp.path().join(".env").exists());
}

#[tokio::test]
async fn test_existing_env_is_loaded_without_prompt() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join(".env"),
        "DOMAIN=shop.example.org\nAPI_DOMAIN=api.shop.example.org\nFRONTEND_PORT=3100\nJWT_SECRET=s3cr3t-value\nJWT_REFRESH_SECRET=another-value\n",
    )
    .unwrap();
    let layout = StorageLayout::new(tmp.path());
    let confirm = AutoConfirm::yes();

    let (settings, outcomes) = load_settings(&layout, &confirm).await.unwrap();

    assert!(confirm.prompts().is_empty());
    assert!(settings.ssl_enabled());
    assert_eq!(settings.frontend_port, 3100);
    assert_eq!(settings.backend_port, 8000);
    assert_eq!(settings.public_api_url, "https://api.shop.example.org");
    assert_eq!(settings.get("NODE_ENV"), Some("production"));

    // Missing secrets are reported but not fatal
    assert!(outcomes.iter().any(|o| o.is_warning() && o.message.contains("POSTGRES_PASSWORD")));

    // Secrets reach compose but never Debug output
    assert!(settings
        .compose_env()
        .contains(&("JWT_SECRET".to_string(), "s3cr3t-value".to_string())));
    assert!(!format!("{:?}", settings).contains("s3cr3t-value"));
}

#[tokio::test]
async fn test_malformed_lines_are_warned() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join(".env"), "DOMAIN=shop.example.org\nthis line is wrong\n").unwrap();
    let layout = StorageLayout::new(tmp.path());

    let (_, outcomes) = load_settings(&layout, &AutoConfirm::yes()).await.unwrap();
    assert!(outcomes.iter().any(|o| o.is_warning() && o.message.contains("line 2")));
}
