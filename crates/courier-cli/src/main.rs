//! courier demo
//!
//! in-memory store / broker で relay を動かす。user / consent / audit の event を
//! publish し、user_auth の handler はわざと一定間隔で失敗させる
//! （retry topic → redelivery / hospital の経路を通す）。
//!
//! ```text
//! RUST_LOG=courier_core=debug cargo run -p courier-cli -- --events 20 --fail-every 3 --backoff-ms 200
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier_core::app::PayloadHandler;
use courier_core::impls::{MemoryBroker, MemoryStore};
use courier_core::ports::Store;
use courier_core::{
    EventEnvelope, HandlerError, Payload, RelayBuilder, RelayConfig, RequestContext, Topic,
};

#[derive(Debug, Parser)]
#[command(name = "courier", about = "Transactional outbox relay demo")]
struct Args {
    /// Events to publish per topic.
    #[arg(long, default_value_t = 10)]
    events: u32,

    /// Every n-th login delivery fails (0 disables failures).
    #[arg(long, default_value_t = 3)]
    fail_every: u64,

    /// How long to let the relay run before shutting down.
    #[arg(long, default_value_t = 3_000)]
    run_for_ms: u64,

    /// Backoff base for redeliveries. Overrides the config file and
    /// COURIER_BACKOFF_BASE_MS when given.
    #[arg(long)]
    backoff_ms: Option<u64>,

    /// JSON config file. COURIER_* variables are applied on top.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserLoggedIn {
    user_id: String,
    ip: Option<String>,
}

impl Payload for UserLoggedIn {
    const TYPE: &'static str = "user.auth.logged_in.v1";
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsentGranted {
    user_id: String,
    scopes: Vec<String>,
}

impl Payload for ConsentGranted {
    const TYPE: &'static str = "consent.granted.v1";
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuditFindingRaised {
    finding_id: String,
    severity: String,
}

impl Payload for AuditFindingRaised {
    const TYPE: &'static str = "audit.finding.raised.v1";
}

/// Fails every `fail_every`-th call.
struct FlakyLogins {
    calls: AtomicU64,
    fail_every: u64,
}

#[async_trait]
impl PayloadHandler<UserLoggedIn> for FlakyLogins {
    async fn handle(&self, envelope: &EventEnvelope, payload: UserLoggedIn) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if self.fail_every > 0 && call % self.fail_every == 0 {
            return Err(HandlerError::retryable(
                "SessionStoreTimeout",
                format!("call {call} for {}", payload.user_id),
            ));
        }
        info!(event_id = %envelope.id(), user_id = %payload.user_id, ip = ?payload.ip, "login recorded");
        Ok(())
    }
}

struct ConsentLedger;

#[async_trait]
impl PayloadHandler<ConsentGranted> for ConsentLedger {
    async fn handle(&self, envelope: &EventEnvelope, payload: ConsentGranted) -> Result<(), HandlerError> {
        info!(event_id = %envelope.id(), user_id = %payload.user_id, scopes = ?payload.scopes, "consent stored");
        Ok(())
    }
}

struct AuditInbox;

#[async_trait]
impl PayloadHandler<AuditFindingRaised> for AuditInbox {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        payload: AuditFindingRaised,
    ) -> Result<(), HandlerError> {
        if payload.severity == "unknown" {
            return Err(HandlerError::fatal("UnclassifiedFinding", payload.finding_id));
        }
        info!(event_id = %envelope.id(), finding_id = %payload.finding_id, "finding filed");
        Ok(())
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Defaults, then the JSON file, then `COURIER_*`, then explicit flags.
fn load_config<F>(args: &Args, get_env: F) -> Result<RelayConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let base = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            RelayConfig::from_json(&raw)?
        }
        None => RelayConfig::default(),
    };
    let mut config = base.with_env_overrides(get_env)?;
    if let Some(backoff_ms) = args.backoff_ms {
        config.retry.backoff_base_ms = backoff_ms;
    }
    config.validate()?;
    Ok(config)
}

async fn publish_all(store: &dyn Store, relay: &courier_core::RunningRelay, events: u32) -> Result<()> {
    let publisher = relay.publisher();
    for n in 0..events {
        // 1 リクエスト = 1 トランザクション
        let ctx = RequestContext::generate();
        let user_id = format!("user-{}", n % 4);
        let mut tx = store.begin().await?;
        publisher
            .send(
                tx.as_mut(),
                &ctx,
                &Topic::USER_AUTH,
                &UserLoggedIn {
                    user_id: user_id.clone(),
                    ip: Some("203.0.113.7".into()),
                },
                Some(&user_id),
            )
            .await?;
        publisher
            .send(
                tx.as_mut(),
                &ctx,
                &Topic::CONSENT,
                &ConsentGranted {
                    user_id: user_id.clone(),
                    scopes: vec!["email".into(), "profile".into()],
                },
                Some(&user_id),
            )
            .await?;
        let severity = if n % 7 == 6 { "unknown" } else { "low" };
        publisher
            .send(
                tx.as_mut(),
                &ctx,
                &Topic::AUDIT_FINDING,
                &AuditFindingRaised {
                    finding_id: format!("finding-{n}"),
                    severity: severity.into(),
                },
                None,
            )
            .await?;
        tx.commit().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = load_config(&args, |key| std::env::var(key).ok())?;
    let store = MemoryStore::new();
    let broker = MemoryBroker::new();

    let relay = RelayBuilder::new(config)
        .store(Arc::new(store.clone()))
        .broker(Arc::new(broker))
        .register_typed::<UserLoggedIn, _>(
            Topic::USER_AUTH,
            FlakyLogins {
                calls: AtomicU64::new(0),
                fail_every: args.fail_every,
            },
        )?
        .register_typed::<ConsentGranted, _>(Topic::CONSENT, ConsentLedger)?
        .register_typed::<AuditFindingRaised, _>(Topic::AUDIT_FINDING, AuditInbox)?
        .expect_topics(&[Topic::USER_AUTH, Topic::CONSENT, Topic::AUDIT_FINDING])
        .build()?;
    let running = relay.start()?;

    publish_all(&store, &running, args.events).await?;
    info!(events = args.events * 3, "events published");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(args.run_for_ms)) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "ctrl-c handler failed");
            }
        }
    }

    let status = running.status().await?;
    println!("{status}");
    for (row_id, record) in store.hospital_records().await? {
        println!(
            "{row_id} {} {}: {} ({})",
            record.envelope.topic(),
            record.envelope.id(),
            record.reason,
            record.cause
        );
    }

    running.shutdown().await;
    Ok(())
}
