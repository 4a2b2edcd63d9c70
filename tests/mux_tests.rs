//! External session adapter tests.
//!
//! The integration tests drive a real tmux server and skip cleanly when
//! the tool is not installed, mirroring the adapter's own fallback.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use termhub::host::MuxServer;
use termhub::{Broker, BrokerConfig, CreateSpec, ListFilter, Sink, SinkEvent};
use termhub::{WindowId, WindowSource};

async fn wait_for<F: FnMut() -> bool>(mut cond: F, secs: u64) -> bool {
    let deadline = Instant::now() + Duration::from_secs(secs);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

fn config_with_prefix(tag: &str) -> BrokerConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let mut cfg = BrokerConfig::default();
    cfg.mux.session_prefix = format!("{tag}{}-", std::process::id());
    cfg
}

fn collecting_sink() -> (Sink, Arc<Mutex<Vec<u8>>>) {
    let bytes = Arc::new(Mutex::new(Vec::new()));
    let sink_bytes = Arc::clone(&bytes);
    let sink: Sink = Box::new(move |event| {
        if let SinkEvent::Bytes(chunk) = event {
            sink_bytes.lock().unwrap().extend_from_slice(&chunk);
        }
        Ok(())
    });
    (sink, bytes)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[tokio::test]
async fn session_and_window_lifecycle() -> anyhow::Result<()> {
    let prefix = format!("thta{}-", std::process::id());
    let Some(server) = MuxServer::detect("tmux", &prefix).await else {
        return Ok(());
    };

    let session = format!("{prefix}lifecycle");
    let cwd = std::env::temp_dir();
    server.ensure_session(&session, &cwd).await?;
    assert!(server.has_session(&session).await);

    // Ensuring again must reuse, not fail.
    server.ensure_session(&session, &cwd).await?;

    let index = server
        .create_window(&session, &cwd, Some("worker"), &[], &["cat".to_string()])
        .await?;
    assert!(server.window_exists(&session, index).await);

    let windows = server.list_windows(&session).await?;
    assert!(windows.iter().any(|w| w.index == index && w.name == "worker"));

    assert!(server.list_sessions().await?.contains(&session));

    server.kill_window(&session, index).await?;
    assert!(!server.window_exists(&session, index).await);

    server.kill_session(&session).await?;
    assert!(!server.has_session(&session).await);
    Ok(())
}

#[tokio::test]
async fn multiplexed_window_round_trip() -> anyhow::Result<()> {
    let cfg = config_with_prefix("thtb");
    let broker = Broker::new(cfg.clone()).await;
    if !broker.multiplexer_available() {
        return Ok(());
    }

    let project = std::env::temp_dir().join("gadget");
    let summary = broker
        .create(
            CreateSpec::command(["cat"])
                .with_cwd(std::env::temp_dir())
                .with_project_path(&project)
                .multiplexed(true),
        )
        .await?;

    assert_eq!(summary.source, WindowSource::Multiplexed);
    let expected_prefix = format!("mux-{}gadget:", cfg.mux.session_prefix);
    assert!(
        summary.id.starts_with(&expected_prefix),
        "unexpected id {}",
        summary.id
    );

    let id: WindowId = summary.id.parse()?;
    let (sink, bytes) = collecting_sink();
    broker.attach(&id, sink, Some((80, 24))).await?;

    broker.write(&id, b"ping\n").await?;
    assert!(
        wait_for(|| contains(&bytes.lock().unwrap(), b"ping"), 5).await,
        "no output came back through the attach pipe"
    );

    broker.kill(&id).await?;
    assert!(broker.list(&ListFilter::default()).is_empty());

    // Drop the whole broker-owned session.
    let server = MuxServer::new("tmux", &cfg.mux.session_prefix);
    let session = server.session_name(&project);
    let _ = server.kill_session(&session).await;
    Ok(())
}

#[tokio::test]
async fn external_windows_survive_broker_restart() -> anyhow::Result<()> {
    let cfg = config_with_prefix("thtc");
    let first = Broker::new(cfg.clone()).await;
    if !first.multiplexer_available() {
        return Ok(());
    }

    let project = std::env::temp_dir().join("phoenix");
    let summary = first
        .create(
            CreateSpec::command(["cat"])
                .with_cwd(std::env::temp_dir())
                .with_project_path(&project)
                .multiplexed(true),
        )
        .await?;
    let id: WindowId = summary.id.parse()?;

    // Tear the broker down without killing the window; the external server
    // keeps it alive.
    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = Broker::new(cfg.clone()).await;
    second.reconcile_external().await?;

    let rediscovered = second.list(&ListFilter {
        source: Some(WindowSource::Multiplexed),
        ..Default::default()
    });
    assert!(
        rediscovered.iter().any(|w| w.id == summary.id),
        "window {id} was not rediscovered"
    );

    second.kill(&id).await?;

    let server = MuxServer::new("tmux", &cfg.mux.session_prefix);
    let session = server.session_name(&project);
    let _ = server.kill_session(&session).await;
    Ok(())
}

#[tokio::test]
async fn reconcile_drops_vanished_windows() -> anyhow::Result<()> {
    let cfg = config_with_prefix("thtd");
    let broker = Broker::new(cfg.clone()).await;
    if !broker.multiplexer_available() {
        return Ok(());
    }

    let project = std::env::temp_dir().join("vanish");
    let summary = broker
        .create(
            CreateSpec::command(["cat"])
                .with_cwd(std::env::temp_dir())
                .with_project_path(&project)
                .multiplexed(true),
        )
        .await?;
    let id: WindowId = summary.id.parse()?;

    // Kill the session behind the broker's back.
    let server = MuxServer::new("tmux", &cfg.mux.session_prefix);
    let session = server.session_name(&project);
    server.kill_session(&session).await?;

    broker.reconcile_external().await?;
    assert!(
        wait_for(|| broker.get(&id).is_err(), 3).await,
        "vanished window still listed"
    );
    Ok(())
}
