use std::path::Path;

use facet::Facet;
use figue as args;
use heapsight::{ClientConfig, SnapshotProxy, WorkerClient, WorkerEvent, load_snapshot_from_file};
use heapsight_types::{Aggregate, DiffForClass, NodeFilter, ProfileUid};
use tracing::{debug, info, warn};

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    #[facet(args::subcommand)]
    command: Command,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum Command {
    /// Instances, shallow and retained size per constructor.
    Summary {
        #[facet(args::named)]
        file: String,
        #[facet(args::named, default)]
        limit: Option<usize>,
    },
    /// Objects allocated and freed between two snapshots, per constructor.
    Diff {
        #[facet(args::named)]
        base: String,
        #[facet(args::named)]
        current: String,
        #[facet(args::named, default)]
        limit: Option<usize>,
    },
    /// Heap totals by category.
    Stats {
        #[facet(args::named)]
        file: String,
    },
}

const DEFAULT_LIMIT: usize = 25;

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build tokio runtime: {err}");
            std::process::exit(1);
        }
    };
    runtime.block_on(async {
        if let Err(err) = run().await {
            eprintln!("{err}");
            std::process::exit(1);
        }
    });
}

async fn run() -> Result<(), String> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let client = WorkerClient::spawn_thread("heapsight-worker", ClientConfig::from_env(), on_worker_event)
        .map_err(|e| format!("failed to start the snapshot worker: {e}"))?;
    client.start_checking_for_long_running_calls();

    let outcome = match cli.command {
        Command::Summary { file, limit } => run_summary(&client, &file, limit.unwrap_or(DEFAULT_LIMIT)).await,
        Command::Diff {
            base,
            current,
            limit,
        } => run_diff(&client, &base, &current, limit.unwrap_or(DEFAULT_LIMIT)).await,
        Command::Stats { file } => run_stats(&client, &file).await,
    };
    client.dispose();
    outcome
}

fn parse_cli() -> Result<Cli, String> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("heapsight")
                .description("Summarize, diff and inspect heap snapshots")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value)
}

fn on_worker_event(event: WorkerEvent) {
    match event {
        WorkerEvent::Progress { message } => debug!(%message, "worker progress"),
        WorkerEvent::BrokenSnapshot { message } => warn!(%message, "snapshot is broken"),
    }
}

async fn load(client: &WorkerClient, file: &str, uid: u64) -> Result<SnapshotProxy, String> {
    let uid = ProfileUid::new(uid).map_err(|e| e.to_string())?;
    let snapshot = load_snapshot_from_file(client, Path::new(file), uid)
        .await
        .map_err(|e| e.to_string())?;
    info!(
        file,
        nodes = snapshot.node_count(),
        total_size = snapshot.total_size(),
        "snapshot loaded"
    );
    Ok(snapshot)
}

// ── Summary ─────────────────────────────────────────────────────────────────

async fn run_summary(client: &WorkerClient, file: &str, limit: usize) -> Result<(), String> {
    let snapshot = load(client, file, 1).await?;
    let aggregates = snapshot.aggregates_with_filter(NodeFilter::everything()).await;
    snapshot.dispose();
    let aggregates = aggregates.map_err(|e| e.to_string())?;

    println!(
        "{:<40} {:>10} {:>10} {:>14} {:>14}",
        "constructor", "count", "distance", "shallow", "retained"
    );
    for aggregate in top_by_retained_size(aggregates.into_values().collect(), limit) {
        println!(
            "{:<40} {:>10} {:>10} {:>14} {:>14}",
            truncate(&aggregate.name, 40),
            aggregate.count,
            aggregate.distance,
            format_bytes(aggregate.shallow_size),
            format_bytes(aggregate.retained_size)
        );
    }
    Ok(())
}

fn top_by_retained_size(mut aggregates: Vec<Aggregate>, limit: usize) -> Vec<Aggregate> {
    aggregates.sort_by(|a, b| b.retained_size.cmp(&a.retained_size).then_with(|| a.name.cmp(&b.name)));
    aggregates.truncate(limit);
    aggregates
}

// ── Diff ────────────────────────────────────────────────────────────────────

async fn run_diff(client: &WorkerClient, base: &str, current: &str, limit: usize) -> Result<(), String> {
    let base = load(client, base, 1).await?;
    let current = match load(client, current, 2).await {
        Ok(current) => current,
        Err(e) => {
            base.dispose();
            return Err(e);
        }
    };

    let diff = async {
        let digest = base.aggregates_for_diff().await?;
        current.calculate_snapshot_diff(base.uid(), digest).await
    }
    .await;
    base.dispose();
    current.dispose();
    let diff = diff.map_err(|e| e.to_string())?;

    println!(
        "{:<40} {:>8} {:>8} {:>8} {:>14} {:>14} {:>14}",
        "constructor", "new", "deleted", "delta", "alloc size", "freed size", "size delta"
    );
    for class in top_by_size_delta(diff, limit) {
        println!(
            "{:<40} {:>8} {:>8} {:>+8} {:>14} {:>14} {:>14}",
            truncate(&class.name, 40),
            class.added_count,
            class.removed_count,
            class.count_delta,
            format_bytes(class.added_size),
            format_bytes(class.removed_size),
            format_signed_bytes(class.size_delta)
        );
    }
    Ok(())
}

fn top_by_size_delta(mut diff: Vec<DiffForClass>, limit: usize) -> Vec<DiffForClass> {
    diff.sort_by(|a, b| {
        b.size_delta
            .unsigned_abs()
            .cmp(&a.size_delta.unsigned_abs())
            .then_with(|| a.name.cmp(&b.name))
    });
    diff.truncate(limit);
    diff
}

// ── Stats ───────────────────────────────────────────────────────────────────

async fn run_stats(client: &WorkerClient, file: &str) -> Result<(), String> {
    let snapshot = load(client, file, 1).await?;
    let statistics = snapshot.get_statistics().await;
    let samples = snapshot.get_samples().await;
    let (node_count, max_id) = (snapshot.node_count(), snapshot.max_js_object_id());
    snapshot.dispose();
    let statistics = statistics.map_err(|e| e.to_string())?;

    println!("{:<14} {:>14}", "nodes", node_count);
    println!("{:<14} {:>14}", "max object id", max_id);
    for (label, bytes) in [
        ("total", statistics.total),
        ("v8 heap", statistics.v8_heap),
        ("native", statistics.native),
        ("code", statistics.code),
        ("strings", statistics.strings),
        ("js arrays", statistics.js_arrays),
        ("system", statistics.system),
    ] {
        println!("{label:<14} {:>14}", format_bytes(bytes));
    }
    match samples {
        Ok(Some(samples)) => println!("{:<14} {:>14}", "samples", samples.timestamps.len()),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "could not read allocation samples"),
    }
    Ok(())
}

// ── Formatting ──────────────────────────────────────────────────────────────

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_signed_bytes(bytes: i64) -> String {
    let sign = if bytes < 0 { "-" } else { "+" };
    format!("{sign}{}", format_bytes(bytes.unsigned_abs()))
}

fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        return name.to_string();
    }
    let mut short: String = name.chars().take(width.saturating_sub(1)).collect();
    short.push('…');
    short
}
