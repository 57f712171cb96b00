//! Synchub CLI - attach to a hub resource and stream replica events.
//!
//! This is the main binary entry point. See the `synchub` library for the
//! protocol core.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use serde_json::{json, Value};
use synchub::session::descriptor;
use synchub::{Client, ClientEvent, Config, ListChange, ListEvent, ObjectEvent, RunnerConfig};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "synchub")]
#[command(about = "Keep local replicas of hub lists and objects in sync")]
#[command(version)]
struct Cli {
    /// Hub URL (overrides config and SYNCHUB_SERVER_URL)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Auth token (overrides SYNCHUB_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach to a synchronized list and print its events as JSON lines
    List {
        /// Resource descriptor
        descriptor: String,
        /// Filter object (JSON) appended to the descriptor
        #[arg(long)]
        filter: Option<String>,
        /// Page size; omit to load the whole list at once
        #[arg(long)]
        preload: Option<usize>,
    },
    /// Attach to a synchronized object and print its events as JSON lines
    Object {
        /// Resource descriptor
        descriptor: String,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the event stream
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(token) = cli.token {
        config.token = token;
    }

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::List {
            descriptor: base,
            filter,
            preload,
        } => {
            let descriptor = match filter {
                Some(filter) => {
                    let filter: Value = serde_json::from_str(&filter).context("--filter is not valid JSON")?;
                    descriptor::with_filter(&base, &filter)
                }
                None => base,
            };
            let preload = preload.or(config.preload_count);
            run(&config, move |client| client.add_list(descriptor, preload))?;
        }
        Commands::Object { descriptor } => {
            run(&config, move |client| client.add_object(descriptor))?;
        }
    }

    Ok(())
}

/// Connect, attach the resource created by `add`, and stream events until
/// Ctrl-C.
fn run(config: &Config, add: impl FnOnce(&mut Client) -> synchub::SessionId) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;

    let mut client = Client::new();
    if !config.has_token() {
        log::warn!("No token configured; the server may refuse attach requests");
    }
    client.authenticate(config.token.clone());
    let id = add(&mut client);
    client.attach(id);
    log::info!("Attaching {}", id);

    runtime.block_on(async {
        let (handle, mut events) = synchub::runner::spawn(client, RunnerConfig::from(config));

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => println!("{}", event_json(&event)),
                    None => break,
                },
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        log::warn!("Failed to listen for Ctrl-C: {e}");
                    }
                    log::info!("Shutting down...");
                    break;
                }
            }
        }

        handle.shutdown().await;
    });

    Ok(())
}

/// One JSON line per client event.
fn event_json(event: &ClientEvent) -> Value {
    match event {
        ClientEvent::LinkConnected => json!({"event": "link", "connected": true}),
        ClientEvent::LinkDisconnected => json!({"event": "link", "connected": false}),
        ClientEvent::IncomingChannel(channel) => json!({"event": "incoming_channel", "channel": channel.as_str()}),
        ClientEvent::ChannelPayload { channel, payload } => {
            json!({"event": "payload", "channel": channel.as_str(), "payload": payload})
        }
        ClientEvent::ChannelState { channel, connected } => {
            json!({"event": "channel", "channel": channel.as_str(), "connected": connected})
        }
        ClientEvent::SessionState { session, state } => {
            json!({"event": "state", "session": session.0, "state": state.to_string()})
        }
        ClientEvent::Attached { session, attached } => {
            json!({"event": "attached", "session": session.0, "attached": attached})
        }
        ClientEvent::List { session, event } => {
            let mut line = list_event_json(event);
            line["event"] = json!("list");
            line["session"] = json!(session.0);
            line
        }
        ClientEvent::Object { session, event } => match event {
            ObjectEvent::PropertyChanged { key, value } => {
                json!({"event": "property", "session": session.0, "key": key, "value": value})
            }
            ObjectEvent::Event(value) => json!({"event": "object_event", "session": session.0, "data": value}),
            ObjectEvent::WriteResult { key, result } => {
                let error = result.as_ref().err().map(|e| json!({"code": e.code, "message": e.message}));
                json!({
                    "event": "write_result",
                    "session": session.0,
                    "key": key,
                    "ok": result.is_ok(),
                    "error": error
                })
            }
            ObjectEvent::MetaChanged { key } => {
                json!({"event": "object", "session": session.0, "kind": "meta_changed", "key": key})
            }
            ObjectEvent::MetadataChanged => {
                json!({"event": "object", "session": session.0, "kind": "metadata_changed"})
            }
            ObjectEvent::Reset => json!({"event": "object", "session": session.0, "kind": "reset"}),
            ObjectEvent::InitializedChanged(value) => {
                json!({"event": "object", "session": session.0, "kind": "initialized", "value": value})
            }
        },
    }
}

fn list_event_json(event: &ListEvent) -> Value {
    match event {
        ListEvent::Changed(change) => json!({"kind": "changed", "change": list_change_json(change)}),
        ListEvent::WriteSucceeded(change) => {
            json!({"kind": "write_succeeded", "change": list_change_json(change)})
        }
        ListEvent::Reset => json!({"kind": "reset"}),
        ListEvent::ItemsLoaded { index, count } => {
            json!({"kind": "items_loaded", "index": index, "count": count})
        }
        ListEvent::MetadataChanged => json!({"kind": "metadata_changed"}),
        ListEvent::RemoteCountChanged(count) => json!({"kind": "remote_count", "count": count}),
        ListEvent::InitializedChanged(value) => json!({"kind": "initialized", "value": value}),
    }
}

fn list_change_json(change: &ListChange) -> Value {
    match change {
        ListChange::Inserted { index, count } => {
            json!({"type": "inserted", "index": index, "count": count})
        }
        ListChange::Removed { index, uuid } => {
            json!({"type": "removed", "index": index, "uuid": uuid})
        }
        ListChange::Updated { index } => json!({"type": "updated", "index": index}),
        ListChange::PropertyChanged { index, property, value } => {
            json!({"type": "property_changed", "index": index, "property": property, "value": value})
        }
        ListChange::Cleared => json!({"type": "cleared"}),
        ListChange::Deleted => json!({"type": "deleted"}),
    }
}
