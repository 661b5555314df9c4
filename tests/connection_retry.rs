mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use plume::connection::{Command, Connection, ConnectionManager};
use plume::errors::EngineError;
use plume::EngineConfig;

use common::{account, ScriptedFactory, StaticTokens};

fn fast_config() -> EngineConfig {
    EngineConfig {
        retry_backoff: Duration::from_millis(1),
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn transport_failure_reconnects_and_retries() {
    let (factory, script) = ScriptedFactory::new();
    script.push_err(EngineError::Transport("connection reset".into()));
    script.push_ok(&["* SEARCH 7"]);

    let mut conn = Connection::new(
        account("a@x.com"),
        Arc::new(factory),
        Arc::new(StaticTokens),
        &fast_config(),
    );

    let lines = conn
        .execute(&Command::Search("ALL".into()))
        .await
        .expect("second attempt succeeds");
    assert_eq!(lines, vec!["* SEARCH 7"]);

    // The failed attempt forced a fresh transport: two connects, two auths.
    assert_eq!(script.connects.load(Ordering::SeqCst), 2);
    assert_eq!(script.auths.load(Ordering::SeqCst), 2);
    assert_eq!(script.command_log().len(), 2);
}

#[tokio::test]
async fn transport_failures_surface_after_attempt_budget() {
    let (factory, script) = ScriptedFactory::new();
    for _ in 0..3 {
        script.push_err(EngineError::Transport("connection reset".into()));
    }

    let mut conn = Connection::new(
        account("a@x.com"),
        Arc::new(factory),
        Arc::new(StaticTokens),
        &fast_config(),
    );

    let err = conn
        .execute(&Command::Search("ALL".into()))
        .await
        .expect_err("budget exhausted");
    assert!(matches!(err, EngineError::Transport(_)));
    assert_eq!(script.command_log().len(), 3);
}

#[tokio::test]
async fn desync_protocol_error_gets_exactly_one_forced_retry() {
    let (factory, script) = ScriptedFactory::new();
    script.push_err(EngineError::Protocol("unexpected response: * BYE".into()));
    script.push_ok(&[]);

    let mut conn = Connection::new(
        account("a@x.com"),
        Arc::new(factory),
        Arc::new(StaticTokens),
        &fast_config(),
    );
    conn.execute(&Command::Expunge)
        .await
        .expect("single forced retry succeeds");
    assert_eq!(script.command_log().len(), 2);

    // A second desync in the same call chain is not retried again.
    let (factory, script) = ScriptedFactory::new();
    script.push_err(EngineError::Protocol("illegal state".into()));
    script.push_err(EngineError::Protocol("illegal state".into()));
    let mut conn = Connection::new(
        account("a@x.com"),
        Arc::new(factory),
        Arc::new(StaticTokens),
        &fast_config(),
    );
    let err = conn
        .execute(&Command::Expunge)
        .await
        .expect_err("second desync propagates");
    assert!(matches!(err, EngineError::Protocol(_)));
    assert_eq!(script.command_log().len(), 2);
}

#[tokio::test]
async fn plain_protocol_error_is_not_retried() {
    let (factory, script) = ScriptedFactory::new();
    script.push_err(EngineError::Protocol("NO [ALERT] quota exceeded".into()));

    let mut conn = Connection::new(
        account("a@x.com"),
        Arc::new(factory),
        Arc::new(StaticTokens),
        &fast_config(),
    );
    let err = conn
        .execute(&Command::Select("INBOX".into()))
        .await
        .expect_err("NO propagates");
    assert!(matches!(err, EngineError::Protocol(_)));
    assert_eq!(script.command_log().len(), 1);
}

#[tokio::test]
async fn account_without_oauth2_fails_before_authenticating() {
    let (factory, script) = ScriptedFactory::new();
    let mut acct = account("a@x.com");
    acct.oauth2_capable = false;

    let mut conn = Connection::new(
        acct,
        Arc::new(factory),
        Arc::new(StaticTokens),
        &fast_config(),
    );
    let err = conn
        .execute(&Command::Select("INBOX".into()))
        .await
        .expect_err("unsupported auth");
    assert!(matches!(err, EngineError::AuthUnsupported));
    assert_eq!(script.auths.load(Ordering::SeqCst), 0);
    assert!(script.command_log().is_empty());
}

#[tokio::test]
async fn manager_pools_one_connection_per_account() {
    let (factory, _script) = ScriptedFactory::new();
    let manager = ConnectionManager::new(
        Arc::new(factory),
        Arc::new(StaticTokens),
        EngineConfig::default(),
    );

    let first = manager.get(&account("a@x.com")).await;
    let second = manager.get(&account("a@x.com")).await;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(manager.pooled().await, 1);

    manager.get(&account("b@y.com")).await;
    assert_eq!(manager.pooled().await, 2);

    manager.close_all().await;
    assert_eq!(manager.pooled().await, 0);
}

#[tokio::test]
async fn manager_replaces_connection_past_idle_threshold() {
    let (factory, _script) = ScriptedFactory::new();
    let config = EngineConfig {
        idle_threshold: Duration::from_millis(10),
        ..EngineConfig::default()
    };
    let manager = ConnectionManager::new(Arc::new(factory), Arc::new(StaticTokens), config);

    let first = manager.get(&account("a@x.com")).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = manager.get(&account("a@x.com")).await;
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(manager.pooled().await, 1);
}
