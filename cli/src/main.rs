use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use collaboard_sync::config::SyncConfig;
use collaboard_sync::presence::Identity;
use collaboard_sync::session::SessionError;
use collaboard_sync::transport::WsTransport;
use collaboard_sync::{Operation, Session, SessionOptions, ShapeKind, ShapeRecord};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("health check failed: HTTP {0}")]
    Unhealthy(u16),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("timed out waiting for the relay")]
    Timeout,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("{0}")]
    InvalidKind(String),
    #[error("input failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "collab-cli", about = "Collaborative canvas replica CLI")]
struct Cli {
    #[arg(long, env = "COLLAB_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[arg(long, env = "COLLAB_NAME", default_value = "cli")]
    name: String,

    /// Seconds to wait for the relay before giving up.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

struct CliContext {
    base_url: String,
    name: String,
    timeout: Duration,
    config: SyncConfig,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the relay's health endpoint.
    Ping,
    /// Print the room's state as JSON lines until interrupted.
    Watch(WatchArgs),
    /// Create or replace one shape.
    Upsert(UpsertArgs),
    /// Remove shapes by id.
    Remove(RemoveArgs),
    /// Upsert shapes read as JSON lines from a file or stdin.
    Stream(StreamArgs),
    /// Track presence at a cursor position and print the roster.
    Presence(PresenceArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(long)]
    room: Uuid,

    #[arg(long, help = "Stop after this many updates")]
    limit: Option<usize>,
}

#[derive(Args, Debug)]
struct UpsertArgs {
    #[arg(long)]
    room: Uuid,

    #[arg(long)]
    kind: String,

    #[arg(long, default_value = "{}", help = "Shape attributes as a JSON object")]
    data: String,

    #[arg(long, help = "Replace this shape instead of creating a new one")]
    id: Option<Uuid>,

    #[arg(long)]
    z_index: Option<i64>,
}

#[derive(Args, Debug)]
struct RemoveArgs {
    #[arg(long)]
    room: Uuid,

    #[arg(required = true)]
    ids: Vec<Uuid>,
}

#[derive(Args, Debug)]
struct StreamArgs {
    #[arg(long)]
    room: Uuid,

    #[arg(long, default_value = "-", help = "Input file path, or - for stdin")]
    input: String,

    #[arg(long, help = "Stop after this many shapes")]
    max_shapes: Option<usize>,

    #[arg(long, default_value_t = 1000)]
    progress_every: usize,
}

#[derive(Args, Debug)]
struct PresenceArgs {
    #[arg(long)]
    room: Uuid,

    #[arg(long, default_value_t = 0.0)]
    x: f64,

    #[arg(long, default_value_t = 0.0)]
    y: f64,

    /// Seconds to stay present before leaving.
    #[arg(long, default_value_t = 2)]
    hold_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let ctx = CliContext {
        base_url: cli.base_url,
        name: cli.name,
        timeout: Duration::from_secs(cli.timeout_secs),
        config: SyncConfig::from_env(),
    };

    match cli.command {
        Command::Ping => run_ping(&ctx).await,
        Command::Watch(args) => run_watch(&ctx, args).await,
        Command::Upsert(args) => run_upsert(&ctx, args).await,
        Command::Remove(args) => run_remove(&ctx, args).await,
        Command::Stream(args) => run_stream(&ctx, args).await,
        Command::Presence(args) => run_presence(&ctx, args).await,
    }
}

async fn run_ping(cli: &CliContext) -> Result<(), CliError> {
    let url = format!("{}/healthz", cli.base_url.trim_end_matches('/'));
    let response = reqwest::Client::new().get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::Unhealthy(status.as_u16()));
    }
    println!("ok");
    Ok(())
}

async fn run_watch(cli: &CliContext, args: WatchArgs) -> Result<(), CliError> {
    let mut session = join_online(cli, args.room).await?;
    let mut notices = session.subscribe_notices();
    let mut last = session.view();
    print_json(&serde_json::to_value(&last)?)?;

    let mut updates = 0_usize;
    while args.limit.is_none_or(|limit| updates < limit) {
        tokio::select! {
            result = session.pump() => {
                result?;
                let view = session.view();
                if view != last {
                    print_json(&serde_json::to_value(&view)?)?;
                    last = view;
                    updates = updates.saturating_add(1);
                }
            }
            Ok(notice) = notices.recv() => {
                print_json(&serde_json::to_value(&notice)?)?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.leave().await?;
    Ok(())
}

async fn run_upsert(cli: &CliContext, args: UpsertArgs) -> Result<(), CliError> {
    let kind = args.kind.parse::<ShapeKind>().map_err(CliError::InvalidKind)?;
    let attributes = serde_json::from_str::<Value>(&args.data)?;

    let mut session = join_online(cli, args.room).await?;
    let mut record = ShapeRecord::new(kind, attributes, session.identity().actor_id);
    if let Some(id) = args.id {
        record.id = id;
    }
    if let Some(z_index) = args.z_index {
        record = record.with_z_index(z_index);
    }

    let applied = session.mutate(Operation::Upsert(vec![record]));
    finish(session).await?;
    print_json(&applied.to_payload())
}

async fn run_remove(cli: &CliContext, args: RemoveArgs) -> Result<(), CliError> {
    let mut session = join_online(cli, args.room).await?;
    let applied = session.mutate(Operation::Remove(args.ids));
    finish(session).await?;
    print_json(&applied.to_payload())
}

async fn run_stream(cli: &CliContext, args: StreamArgs) -> Result<(), CliError> {
    let mut reader: Box<dyn BufRead> = if args.input == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(File::open(&args.input)?))
    };

    let mut session = join_online(cli, args.room).await?;
    let actor = session.identity().actor_id;
    let mut sent = 0_usize;
    let mut skipped = 0_usize;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }

        let Some(record) = parse_jsonl_shape_line(&line, actor)? else {
            skipped = skipped.saturating_add(1);
            continue;
        };
        session.mutate(Operation::Upsert(vec![record]));

        sent = sent.saturating_add(1);
        if args.progress_every > 0 && sent.is_multiple_of(args.progress_every) {
            session.settle().await?;
            eprintln!("streamed {sent} shapes...");
        }
        if args.max_shapes.is_some_and(|limit| sent >= limit) {
            break;
        }
    }

    let room = session.room_id();
    finish(session).await?;
    eprintln!("stream complete: room_id={room} upserted={sent} skipped={skipped}");
    Ok(())
}

async fn run_presence(cli: &CliContext, args: PresenceArgs) -> Result<(), CliError> {
    let mut session = join_online(cli, args.room).await?;
    session.move_cursor(args.x, args.y);
    session.settle().await?;

    let hold = tokio::time::sleep(Duration::from_secs(args.hold_secs));
    tokio::pin!(hold);
    loop {
        tokio::select! {
            () = &mut hold => break,
            result = session.pump() => result?,
        }
    }

    print_json(&serde_json::to_value(session.view().online)?)?;
    session.leave().await?;
    Ok(())
}

/// Join `room` over WebSocket and wait until the channel is subscribed.
async fn join_online(cli: &CliContext, room: Uuid) -> Result<Session, CliError> {
    let transport = WsTransport::new(ws_url(&cli.base_url)?, &cli.config);
    let options = SessionOptions::from_config(Identity::new(cli.name.clone()), room, cli.config.clone());
    let mut session = Session::join(&transport, options).await?;

    tokio::time::timeout(cli.timeout, async {
        while !session.connection_state().is_online() {
            session.pump().await?;
        }
        Ok::<(), SessionError>(())
    })
    .await
    .map_err(|_| CliError::Timeout)??;
    Ok(session)
}

/// Wait for outstanding publishes, then leave. Anything still queued is
/// reported; it survives only when `SYNC_QUEUE_PATH` is set.
async fn finish(session: Session) -> Result<(), CliError> {
    session.settle().await?;
    let queued = session.view().queued;
    if queued > 0 {
        eprintln!("warning: {queued} operation(s) still queued");
    }
    session.leave().await?;
    Ok(())
}

fn ws_url(base_url: &str) -> Result<String, CliError> {
    let base = base_url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("http://") {
        return Ok(format!("ws://{rest}/ws"));
    }
    if let Some(rest) = base.strip_prefix("https://") {
        return Ok(format!("wss://{rest}/ws"));
    }

    Err(CliError::InvalidBaseUrl(base_url.to_owned()))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}

/// One input line → a record owned by `actor`.
///
/// Accepts full shape records, or bare objects with a `kind` whose other
/// fields become the attributes. Blank lines and objects without a `kind`
/// are skipped.
fn parse_jsonl_shape_line(line: &str, actor: Uuid) -> Result<Option<ShapeRecord>, CliError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let mut value = serde_json::from_str::<Value>(trimmed)?;
    if let Ok(record) = serde_json::from_value::<ShapeRecord>(value.clone()) {
        return Ok(Some(record));
    }

    let Some(map) = value.as_object_mut() else {
        return Ok(None);
    };
    let Some(kind) = map.remove("kind") else {
        return Ok(None);
    };
    let kind = kind.as_str().unwrap_or_default().parse::<ShapeKind>().map_err(CliError::InvalidKind)?;
    let z_index = map.remove("zIndex").as_ref().and_then(Value::as_i64);
    map.remove("id");

    let mut record = ShapeRecord::new(kind, value, actor);
    if let Some(z_index) = z_index {
        record = record.with_z_index(z_index);
    }
    Ok(Some(record))
}
