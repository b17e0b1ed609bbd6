use clap::{CommandFactory, Parser};
use colored::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use klientel_sync::cli::{Args, Command};
use klientel_sync::graphql::GraphqlClient;
use klientel_sync::transport::ws::WsTransport;
use klientel_sync::{Comment, Credential, NoticeLevel, SyncConfig, SyncEngine};

type Engine = SyncEngine<WsTransport, GraphqlClient>;

fn print_comment(comment: &Comment) {
    let author = comment.user_id.as_deref().unwrap_or("?");
    let stamp = comment.created_at.format("%Y-%m-%d %H:%M:%S");
    let marker = if comment.provisional { "~" } else { " " };
    println!(
        "{}{} {} {}",
        marker,
        stamp.to_string().dimmed(),
        format!("[{author}]").cyan(),
        comment.content
    );
}

/// Print comments not shown yet, in display order.
fn print_new(engine: &Engine, lead_id: &str, shown: &mut HashSet<String>) {
    for comment in engine.comments(lead_id) {
        if shown.insert(comment.id.clone()) {
            print_comment(&comment);
        }
    }
}

async fn watch(engine: Arc<Engine>, lead_id: String) -> Result<(), Box<dyn std::error::Error>> {
    let guard = engine.subscribe(&lead_id).await;
    if let Some(err) = engine.error() {
        eprintln!("{} {}", "error:".red().bold(), err);
    }
    println!(
        "{} lead {} ({} comments, {:?})",
        "watching".green().bold(),
        lead_id.bold(),
        engine.comments(&lead_id).len(),
        engine.membership_state(&lead_id)
    );

    let mut shown = HashSet::new();
    print_new(&engine, &lead_id, &mut shown);

    let mut changes = WatchStream::new(engine.changes());
    let mut notices = BroadcastStream::new(engine.notices());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.next() => {
                if change.is_none() {
                    break;
                }
                print_new(&engine, &lead_id, &mut shown);
            }
            Some(Ok(notice)) = notices.next() => {
                match notice.level {
                    NoticeLevel::Error => eprintln!("{} {}", "error:".red().bold(), notice.message),
                    NoticeLevel::Info | NoticeLevel::Success => {
                        println!("{}", notice.message.as_str().italic().dimmed())
                    }
                }
            }
        }
    }

    guard.release().await;
    engine.set_credential(None).await;
    Ok(())
}

async fn post(engine: Arc<Engine>, lead_id: String, content: String) -> Result<(), Box<dyn std::error::Error>> {
    let guard = engine.subscribe(&lead_id).await;
    let result = engine.add_comment(&lead_id, &content).await;
    guard.release().await;
    engine.set_credential(None).await;

    let comment = result?;
    println!("{} {}", "posted".green().bold(), comment.id.bold());
    print_comment(&comment);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Command::Completions { shell } = &args.command {
        let mut cmd = Args::command();
        clap_complete::generate(*shell, &mut cmd, "klientel-sync", &mut std::io::stdout());
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = SyncConfig::load(args.config.as_deref())?;
    args.apply_overrides(&mut config);
    config.validate()?;

    let token = args
        .token
        .clone()
        .ok_or("no token: pass --token or set KLIENTEL_TOKEN")?;

    let transport = WsTransport::from_config(&config);
    let api = GraphqlClient::from_config(&config)?;
    let engine = SyncEngine::new(config, transport, api);

    engine.set_credential(Some(Credential::new(token))).await;
    if !engine.connection().is_connected() {
        eprintln!(
            "{} room server unreachable; showing fetched comments only",
            "warning:".yellow().bold()
        );
    }

    match args.command {
        Command::Watch { lead_id } => watch(engine, lead_id).await,
        Command::Post { lead_id, content } => post(engine, lead_id, content).await,
        Command::Completions { .. } => Ok(()),
    }
}
