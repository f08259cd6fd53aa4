//! `visitsync` command line entry point.
//!
//! Operates on the same database file the app uses, so pending work can be
//! inspected and pushed by hand.

use std::sync::Arc;

use anyhow::{Context, bail};
use serde_json::{Value, json};
use visitsync_client::{SyncConfig, SyncContext};
use visitsync_core::EntityKind;

const USAGE: &str = "usage: visitsync <status|sync|retry|refresh|pending|list <entity>>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    visitsync_observability::init();

    let config = SyncConfig::from_env()?;
    let online = !matches!(
        std::env::var("VISITSYNC_OFFLINE").as_deref(),
        Ok("1") | Ok("true")
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!(USAGE);
    };

    tracing::debug!(?config, command = %command, "starting");
    let ctx = SyncContext::open(&config, online, None)
        .await
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;

    let output = run(&ctx, command, &args[1..]).await;
    ctx.shutdown().await;
    print(&output?)
}

async fn run(ctx: &Arc<SyncContext>, command: &str, rest: &[String]) -> anyhow::Result<Value> {
    match command {
        "status" => {
            let status = ctx.status().await?;
            let queue = ctx.queue().summary().await?;
            Ok(json!({ "status": status, "queue": queue }))
        }
        "sync" => Ok(serde_json::to_value(ctx.orchestrator().drain().await)?),
        "retry" => Ok(serde_json::to_value(ctx.orchestrator().retry_failed().await)?),
        "refresh" => {
            ctx.facade().force_refresh().await.context("refresh failed")?;
            Ok(json!({ "refreshed": EntityKind::ALL.map(|k| k.collection()) }))
        }
        "pending" => Ok(serde_json::to_value(ctx.queue().list_all().await?)?),
        "list" => {
            let Some(entity) = rest.first() else {
                bail!(USAGE);
            };
            let kind: EntityKind = entity.parse()?;
            let records = ctx.facade().get_all(kind).await?;
            Ok(Value::Array(
                records
                    .into_iter()
                    .map(|tracked| {
                        json!({
                            "pending": tracked.is_pending(),
                            "record": tracked.into_inner().to_value(),
                        })
                    })
                    .collect(),
            ))
        }
        other => bail!("unknown command {other:?}\n{USAGE}"),
    }
}

fn print(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
