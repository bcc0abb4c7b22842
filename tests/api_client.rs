mod common;

use common::{MockServer, RawServer, progress_json, raw_response};
use duplicati_monitor::api::{ApiClient, ApiError, BackupApi, Phase, Reply};
use duplicati_monitor::auth::{AuthError, AuthKind};
use serde_json::json;

fn client(server: &MockServer, auth: AuthKind) -> ApiClient {
    ApiClient::from_config(&server.server_config(auth)).unwrap()
}

#[tokio::test]
async fn challenge_login_happens_once_across_calls() {
    let server = MockServer::start().await;
    let client = client(&server, AuthKind::Challenge);

    let first = client.get_job("1").await.unwrap().into_result().unwrap();
    let second = client.get_job("1").await.unwrap().into_result().unwrap();

    assert_eq!(first, second);
    assert_eq!(first.name(), "Documents");
    assert_eq!(first.metadata().source_size, Some(2048));
    server.with(|s| {
        assert_eq!(s.root_hits, 1);
        assert_eq!(s.nonce_requests, 1);
        assert_eq!(s.password_logins, 1);
        assert_eq!(s.job_gets, 2);
    });
}

#[tokio::test]
async fn wrong_password_is_invalid_secret() {
    let server = MockServer::start().await;
    let mut config = server.server_config(AuthKind::Challenge);
    config.password = Some("not-the-password".to_string());
    let client = ApiClient::from_config(&config).unwrap();

    let result = client.get_job("1").await;

    assert!(matches!(
        result,
        Err(ApiError::Auth(AuthError::InvalidSecret(_)))
    ));
    server.with(|s| assert_eq!(s.job_gets, 0));
}

#[tokio::test]
async fn missing_xsrf_is_retried_once() {
    let server = MockServer::start().await;
    let client = client(&server, AuthKind::Challenge);
    client.get_job("1").await.unwrap();

    server.with(|s| s.missing_xsrf = 1);
    let retried = client.get_job("1").await.unwrap();
    assert!(!retried.is_error());
    server.with(|s| assert_eq!(s.root_hits, 2));

    server.with(|s| s.missing_xsrf = 2);
    let result = client.get_job("1").await;
    assert!(matches!(result, Err(ApiError::MissingCsrf)));
    server.with(|s| {
        assert_eq!(s.root_hits, 3);
        assert_eq!(s.missing_xsrf, 0);
    });
}

#[tokio::test]
async fn rejected_session_forces_a_new_login() {
    let server = MockServer::start().await;
    let client = client(&server, AuthKind::Challenge);
    client.get_job("1").await.unwrap();

    server.with(|s| s.reject_sessions = true);
    let rejected = client.get_job("1").await;
    assert!(matches!(
        rejected,
        Err(ApiError::Auth(AuthError::InvalidSecret(_)))
    ));

    server.with(|s| s.reject_sessions = false);
    client.get_job("1").await.unwrap();
    server.with(|s| assert_eq!(s.password_logins, 2));
}

#[tokio::test]
async fn start_refused_while_a_backup_runs() {
    let server = MockServer::start().await;
    let client = client(&server, AuthKind::Challenge);

    server.with(|s| s.progress = Some(progress_json("7", "Backup_ProcessingFiles")));
    let result = client.start_job("1").await;

    match result {
        Err(ApiError::AlreadyRunning { job_id }) => assert_eq!(job_id, "7"),
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }
    server.with(|s| assert_eq!(s.run_posts, 0));
}

#[tokio::test]
async fn start_allowed_when_idle() {
    let server = MockServer::start().await;
    let client = client(&server, AuthKind::Challenge);

    let response = client.start_job("1").await.unwrap().into_result().unwrap();

    assert!(response.accepted());
    assert_eq!(response.task_id, Some(5));
    server.with(|s| assert_eq!(s.run_posts, 1));
}

#[tokio::test]
async fn idle_progress_is_a_server_error_reply() {
    let server = MockServer::start().await;
    let client = client(&server, AuthKind::Challenge);

    match client.get_progress().await.unwrap() {
        Reply::Error(error) => {
            assert_eq!(error.message, "No active backup");
            assert_eq!(error.code, Some(404));
        }
        Reply::Data(progress) => panic!("unexpected progress {progress:?}"),
    }

    server.with(|s| s.progress = Some(progress_json("1", "Backup_Complete")));
    let progress = client.get_progress().await.unwrap().into_result().unwrap();
    assert_eq!(progress.phase, Phase::Complete);
    assert_eq!(progress.total_file_count, 12);
}

#[tokio::test]
async fn unknown_job_is_a_remote_error() {
    let server = MockServer::start().await;
    let client = client(&server, AuthKind::Challenge);

    let reply = client.get_job("2").await.unwrap();

    assert!(reply.is_error());
    assert!(matches!(reply.into_result(), Err(ApiError::Remote(_))));
}

#[tokio::test]
async fn malformed_job_id_never_reaches_the_server() {
    let server = MockServer::start().await;
    let client = client(&server, AuthKind::Challenge);

    assert!(matches!(
        client.get_job("1/../2").await,
        Err(ApiError::Validation(_))
    ));
    assert!(matches!(
        client.delete_job("").await,
        Err(ApiError::Validation(_))
    ));
    server.with(|s| assert_eq!(s.root_hits, 0));
}

#[tokio::test]
async fn update_and_delete_pass_through() {
    let server = MockServer::start().await;
    let client = client(&server, AuthKind::Challenge);

    let patch = json!({ "Backup": { "Name": "Photos" } });
    client.update_job("1", &patch).await.unwrap().into_result().unwrap();
    client.delete_job("1").await.unwrap().into_result().unwrap();

    assert!(matches!(
        client.update_job("1", &json!({})).await,
        Err(ApiError::Validation(_))
    ));
    server.with(|s| {
        assert_eq!(s.updates, vec![patch.clone()]);
        assert_eq!(s.deleted, vec!["1".to_string()]);
    });
}

#[tokio::test]
async fn token_login_uses_bearer_header() {
    let server = MockServer::start().await;
    let client = client(&server, AuthKind::Token);

    client.get_job("1").await.unwrap().into_result().unwrap();
    let jobs = client.list_jobs().await.unwrap().into_result().unwrap();
    let info = client.get_system_info().await.unwrap().into_result().unwrap();

    assert_eq!(jobs.len(), 1);
    assert_eq!(info.server_version.as_deref(), Some("2.1.0.5"));
    server.with(|s| {
        assert_eq!(s.token_logins, 1);
        assert_eq!(s.password_logins, 0);
        assert_eq!(s.root_hits, 0);
    });
}

#[tokio::test]
async fn xsrf_session_cookie_without_expiry_is_accepted() {
    let server = MockServer::start().await;
    server.with(|s| s.session_xsrf = true);
    let client = client(&server, AuthKind::Challenge);

    let info = client.get_system_info().await.unwrap().into_result().unwrap();
    client.get_job("1").await.unwrap().into_result().unwrap();

    assert_eq!(info.machine_name.as_deref(), Some("nas"));
    server.with(|s| {
        assert_eq!(s.root_hits, 1);
        assert_eq!(s.password_logins, 1);
    });
}

#[tokio::test]
async fn redirect_to_login_page_drops_the_session() {
    let server = MockServer::start().await;
    let client = client(&server, AuthKind::Challenge);
    client.get_job("1").await.unwrap();
    assert!(client.auth().is_valid(chrono::Utc::now()));

    server.with(|s| s.redirect_to_login = true);
    let result = client.get_job("1").await;

    assert!(matches!(
        result,
        Err(ApiError::Auth(AuthError::InvalidSecret(_)))
    ));
    assert!(!client.auth().is_valid(chrono::Utc::now()));
}

#[tokio::test]
async fn login_bounced_to_login_page_is_invalid_secret() {
    let server = MockServer::start().await;
    server.with(|s| s.redirect_to_login = true);
    let client = client(&server, AuthKind::Challenge);

    let result = client.get_job("1").await;

    assert!(matches!(
        result,
        Err(ApiError::Auth(AuthError::InvalidSecret(_)))
    ));
    server.with(|s| {
        assert_eq!(s.nonce_requests, 1);
        assert_eq!(s.password_logins, 0);
        assert_eq!(s.job_gets, 0);
    });
}

fn xsrf_root() -> String {
    raw_response("200 OK", &["Set-Cookie: xsrf-token=raw-token; Path=/"], "")
}

#[tokio::test]
async fn missing_xsrf_reason_phrase_alone_triggers_retry() {
    let server = RawServer::start(|path, hit| match (path, hit) {
        ("/", _) => xsrf_root(),
        ("/api/v1/progressstate", 1) => raw_response("400 Missing XSRF Token", &[], ""),
        ("/api/v1/progressstate", _) => raw_response(
            "200 OK",
            &["Content-Type: application/json"],
            r#"{"BackupID":"1","Phase":"Backup_ProcessingFiles","OverallProgress":0.5}"#,
        ),
        _ => raw_response("404 Not Found", &[], ""),
    })
    .await;
    let mut config = duplicati_monitor::config::ServerConfig::new(server.url());
    config.password = None;
    let client = ApiClient::from_config(&config).unwrap();

    let progress = client.get_progress().await.unwrap().into_result().unwrap();

    assert_eq!(progress.phase, Phase::Running("Backup_ProcessingFiles".to_string()));
    assert_eq!(server.hits("/"), 2);
    assert_eq!(server.hits("/api/v1/progressstate"), 2);
}

#[tokio::test]
async fn repeated_missing_xsrf_reason_phrase_is_surfaced() {
    let server = RawServer::start(|path, _| match path {
        "/" => xsrf_root(),
        _ => raw_response("400 Missing XSRF Token", &[], ""),
    })
    .await;
    let mut config = duplicati_monitor::config::ServerConfig::new(server.url());
    config.password = None;
    let client = ApiClient::from_config(&config).unwrap();

    let result = client.get_progress().await;

    assert!(matches!(result, Err(ApiError::MissingCsrf)));
    assert_eq!(server.hits("/api/v1/progressstate"), 2);
}
