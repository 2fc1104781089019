use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{
    load_settings,
    simulated::{inbox_for, SimOp, SimulatedNetwork, StaticSigner},
    SyncEngine,
};
use serde_json::json;
use shared::{domain::ConversationId, protocol::ConversationTarget};
use storage::{prepare_database_url, Storage, DEFAULT_DATABASE_URL};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the engine against an in-process network and prints its events.
    Simulate {
        #[arg(long, default_value = "alice")]
        identity: String,
        /// Readiness checks a new group fails before it becomes sendable.
        #[arg(long, default_value_t = 2)]
        group_publish_checks: u32,
        #[arg(long, default_value_t = 3)]
        incoming: u32,
        /// Breaks the next sync with a crypto-core fault to drive the ladder.
        #[arg(long)]
        inject_instability: bool,
        /// Persist the cache here instead of keeping it in memory.
        #[arg(long)]
        database_url: Option<String>,
        #[arg(long, default_value_t = 1_000)]
        linger_ms: u64,
    },
    /// Lists persisted conversations with their message counts.
    Inspect {
        #[arg(long, default_value = DEFAULT_DATABASE_URL)]
        database_url: String,
    },
    /// Removes one conversation and its messages from the persisted cache.
    Evict {
        #[arg(long, default_value = DEFAULT_DATABASE_URL)]
        database_url: String,
        conversation_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            identity,
            group_publish_checks,
            incoming,
            inject_instability,
            database_url,
            linger_ms,
        } => {
            simulate(
                &identity,
                group_publish_checks,
                incoming,
                inject_instability,
                database_url,
                Duration::from_millis(linger_ms),
            )
            .await?
        }
        Command::Inspect { database_url } => {
            let storage = open_storage(&database_url).await?;
            for conversation in storage.list_conversations().await? {
                let messages = storage.list_messages(&conversation.id).await?;
                println!(
                    "{}",
                    json!({
                        "id": conversation.id,
                        "kind": conversation.kind().as_str(),
                        "membership_published": conversation.membership_published,
                        "cursor": conversation.cursor,
                        "messages": messages.len(),
                    })
                );
            }
        }
        Command::Evict {
            database_url,
            conversation_id,
        } => {
            let storage = open_storage(&database_url).await?;
            let removed = storage
                .delete_conversation(&ConversationId::new(conversation_id.clone()))
                .await?;
            println!("evicted conversation_id={conversation_id} removed={removed}");
        }
    }

    Ok(())
}

async fn open_storage(database_url: &str) -> Result<Storage> {
    let url = prepare_database_url(database_url)?;
    Storage::new(&url).await
}

async fn simulate(
    identity: &str,
    group_publish_checks: u32,
    incoming: u32,
    inject_instability: bool,
    database_url: Option<String>,
    linger: Duration,
) -> Result<()> {
    let mut settings = load_settings();
    if database_url.is_some() {
        settings.cache_database_url = database_url;
    }

    let network = SimulatedNetwork::new();
    network.set_group_publish_checks(group_publish_checks).await;
    network.register("bob").await;

    let engine = SyncEngine::open(network.connector(), &settings).await?;
    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::warn!(error = %err, "probe: unprintable event"),
            }
        }
    });

    engine
        .initialize(Some(StaticSigner::new(identity)))
        .await?;

    let dm = network
        .create_remote("bob", &ConversationTarget::Direct(inbox_for(identity)))
        .await?;
    for n in 1..=incoming {
        network
            .deliver_remote("bob", &dm, &format!("message {n} from bob"))
            .await?;
    }
    engine.force_discover().await;

    let group = engine
        .create_conversation(ConversationTarget::Group(vec![inbox_for("bob")]))
        .await?;
    let sent = engine.send_message(&group, "hello group").await?;
    info!(message_id = %sent.id, "probe: group message sent");
    engine.send_message(&dm, "hi bob").await?;

    if inject_instability {
        network
            .fail_next(SimOp::Sync, "RuntimeError: unreachable executed")
            .await;
        engine.force_discover().await;
    }

    tokio::time::sleep(linger).await;

    for conversation in engine.get_conversations().await {
        let readiness = engine.get_readiness(&conversation.id).await;
        println!(
            "{}",
            json!({
                "summary": "conversation",
                "id": conversation.id,
                "kind": conversation.kind().as_str(),
                "messages": engine.get_messages(&conversation.id).await.len(),
                "readiness": readiness,
            })
        );
    }
    println!(
        "{}",
        json!({ "summary": "recovery", "status": engine.recovery_status().await })
    );

    engine.shutdown().await;
    printer.abort();
    Ok(())
}
