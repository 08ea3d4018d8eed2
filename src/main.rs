use std::sync::Arc;
use std::time::Duration;

use mail_triage::channels::{GmailClient, SlackNotifier, WebhookState, webhook_routes};
use mail_triage::config::{GmailConfig, ServerConfig, SlackConfig, TriageConfig};
use mail_triage::error::ChannelError;
use mail_triage::pipeline::heuristic::KeywordClassifier;
use mail_triage::pipeline::{
    Boundaries, MailboxScheduler, TriageOrchestrator, shutdown_channel,
};
use mail_triage::store::{CursorStore, LibSqlCursorStore};

/// Extra time for workers to return after the in-flight grace period ends.
const DRAIN_MARGIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let triage_config = TriageConfig::from_env()?;
    let gmail_config = GmailConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export GMAIL_ACCESS_TOKEN=ya29...");
        std::process::exit(1);
    });
    let slack_config = SlackConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export SLACK_BOT_TOKEN=xoxb-... SLACK_CHANNEL_ID=C...");
        std::process::exit(1);
    });
    let server_config = ServerConfig::from_env();

    eprintln!("📬 Mail Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook/pubsub", server_config.port);
    eprintln!("   Triggers: http://0.0.0.0:{}/api/v1/triggers", server_config.port);
    eprintln!("   Urgent label: {}", triage_config.urgent_label);
    eprintln!(
        "   Classification: {:?}, recovery: {:?}, workers: {}",
        triage_config.classification_policy,
        triage_config.recovery,
        triage_config.worker_concurrency
    );
    eprintln!("   Slack channel: {}", slack_config.channel_id);
    match &gmail_config.pubsub_topic {
        Some(topic) => eprintln!("   Push topic: {topic} ({})", gmail_config.watch_mailbox),
        None => eprintln!("   Push topic: not set, relying on manual triggers"),
    }

    // ── Cursor store ────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&server_config.db_path);
    let store: Arc<dyn CursorStore> = Arc::new(
        LibSqlCursorStore::new_local(db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open cursor store at {}: {}",
                    server_config.db_path, e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", server_config.db_path);

    // ── Boundaries ──────────────────────────────────────────────────────
    let watch_mailbox = gmail_config.watch_mailbox.clone();
    let pubsub_topic = gmail_config.pubsub_topic.clone();
    let gmail = Arc::new(GmailClient::new(gmail_config));
    let boundaries = Boundaries {
        changes: gmail.clone(),
        messages: gmail.clone(),
        classifier: Arc::new(KeywordClassifier::from_env()?),
        labels: gmail.clone(),
        notifier: Arc::new(SlackNotifier::new(slack_config)),
    };

    // ── Pipeline ────────────────────────────────────────────────────────
    let (trigger, signal) = shutdown_channel();
    let shutdown_grace = triage_config.shutdown_grace;
    let batch_retry = triage_config.batch_retry.clone();
    let orchestrator = Arc::new(
        TriageOrchestrator::new(triage_config, Arc::clone(&store), boundaries)
            .with_shutdown(signal.clone()),
    );
    let scheduler = MailboxScheduler::new(orchestrator, batch_retry, signal, None);

    // ── HTTP ingress ────────────────────────────────────────────────────
    let app = webhook_routes(WebhookState {
        scheduler: scheduler.clone(),
        store,
        api_key: server_config.api_key.map(Arc::new),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server_config.port))
        .await
        .map_err(|e| ChannelError::StartupFailed(format!("port {}: {e}", server_config.port)))?;
    tracing::info!(port = server_config.port, "Webhook server started");

    // Registration lapses after about a week; a restart renews it.
    if let Some(topic) = &pubsub_topic {
        if let Err(e) = gmail.watch(&watch_mailbox, topic).await {
            tracing::error!(mailbox = %watch_mailbox, topic = %topic, error = %e, "Push registration failed");
        }
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    trigger.trigger();
    if pubsub_topic.is_some() {
        if let Err(e) = gmail.stop(&watch_mailbox).await {
            tracing::warn!(mailbox = %watch_mailbox, error = %e, "Failed to stop push notifications");
        }
    }
    if !scheduler.drain(shutdown_grace + DRAIN_MARGIN).await {
        tracing::warn!("Exiting with batches still running; their messages replay on restart");
    }

    Ok(())
}
