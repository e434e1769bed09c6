use anyhow::{bail, Context, Result};
use clap::Parser;
use nostr::{RelayUrl, SubscriptionId};
use nostr_subscriptions::{
    config, metrics, ChannelRelay, ClientMessage, EngineSettings, Filter, ManualTimer,
    RelayMessage, SharedRelay, Subscription, SubscriptionManager, SubscriptionOptions,
};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "nostr_subscriptions",
    version = "0.1.0",
    about = "Replays a captured relay log through the subscription engine"
)]
struct Args {
    /// Relay log with one `<relay-url>\t<relay message json>` per line. Reads
    /// stdin when omitted.
    input: Option<PathBuf>,

    /// Path to config directory
    #[arg(short, long, default_value = "config")]
    config_dir: String,

    /// Filter as a NIP-01 JSON object. Repeat for several filters.
    #[arg(short, long = "filter", required = true)]
    filters: Vec<String>,

    /// Relay to attach besides those found in the log
    #[arg(short, long = "relay")]
    relays: Vec<String>,

    /// Number of identical subscriptions to create
    #[arg(long, default_value_t = 1)]
    copies: usize,

    /// Route subscriptions through the grouper instead of starting them directly
    #[arg(short, long)]
    group: bool,

    /// Stop each subscription once every relay has sent EOSE
    #[arg(long)]
    close_on_eose: bool,

    /// Print Prometheus metrics after the replay
    #[arg(short, long)]
    metrics: bool,
}

struct LogLine {
    relay: RelayUrl,
    message: RelayMessage,
}

fn setup_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nostr_subscriptions=debug"));

    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_timer(fmt::time::SystemTime)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_level(true)
        .init();
}

fn load_settings(config_dir: &str) -> Result<EngineSettings> {
    if !Path::new(config_dir).join("settings.yml").exists() {
        info!("No settings.yml in {}, using defaults", config_dir);
        return Ok(EngineSettings::default());
    }
    let config = config::Config::new(config_dir).context("Failed to load configuration")?;
    config
        .get_settings()
        .context("Failed to get engine settings")
}

async fn read_input(input: Option<&Path>) -> Result<String> {
    let mut contents = String::new();
    match input {
        Some(path) => {
            contents = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
        }
        None => {
            tokio::io::stdin()
                .read_to_string(&mut contents)
                .await
                .context("Failed to read stdin")?;
        }
    }
    Ok(contents)
}

fn parse_log(contents: &str) -> Vec<LogLine> {
    let mut lines = Vec::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((relay, json)) = line.split_once('\t') else {
            warn!("Line {}: missing tab separator", number + 1);
            continue;
        };
        let relay = match RelayUrl::parse(relay.trim()) {
            Ok(relay) => relay,
            Err(e) => {
                warn!("Line {}: invalid relay url: {}", number + 1, e);
                continue;
            }
        };
        match RelayMessage::from_json(json) {
            Ok(message) => lines.push(LogLine { relay, message }),
            Err(e) => warn!("Line {}: {}", number + 1, e),
        }
    }
    lines
}

/// Relay-level subscription ids each relay was asked to open.
fn opened_ids(
    receivers: &mut HashMap<RelayUrl, mpsc::UnboundedReceiver<ClientMessage>>,
) -> HashMap<RelayUrl, Vec<SubscriptionId>> {
    let mut opened = HashMap::new();
    for (relay, receiver) in receivers.iter_mut() {
        let mut ids: Vec<SubscriptionId> = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            if let ClientMessage::Req {
                subscription_id, ..
            } = message
            {
                if !ids.contains(&subscription_id) {
                    ids.push(subscription_id);
                }
            }
        }
        debug!("[{}] Opened {} relay subscription(s)", relay, ids.len());
        opened.insert(relay.clone(), ids);
    }
    opened
}

/// Rewrites captured subscription ids to the ids opened in this run.
fn retarget(message: RelayMessage, ids: &[SubscriptionId]) -> Vec<RelayMessage> {
    let Some(first) = ids.first() else {
        return vec![message];
    };
    match message {
        RelayMessage::Event { event, .. } => vec![RelayMessage::Event {
            subscription_id: first.clone(),
            event,
        }],
        RelayMessage::EndOfStoredEvents(_) => ids
            .iter()
            .cloned()
            .map(RelayMessage::EndOfStoredEvents)
            .collect(),
        RelayMessage::Closed { message, .. } => ids
            .iter()
            .map(|subscription_id| RelayMessage::Closed {
                subscription_id: subscription_id.clone(),
                message: message.clone(),
            })
            .collect(),
        other => vec![other],
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let args = Args::parse();
    if args.copies == 0 {
        bail!("--copies must be at least 1");
    }
    let metrics_handle = if args.metrics {
        Some(metrics::setup_metrics()?)
    } else {
        None
    };

    let settings = load_settings(&args.config_dir)?;
    let filters = args
        .filters
        .iter()
        .map(|json| Filter::from_json(json))
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid --filter")?;

    let log = parse_log(&read_input(args.input.as_deref()).await?);
    info!("Loaded {} relay message(s)", log.len());

    let mut urls: BTreeSet<String> = log.iter().map(|line| line.relay.to_string()).collect();
    urls.extend(args.relays.iter().cloned());

    let mut relays: Vec<SharedRelay> = Vec::new();
    let mut receivers = HashMap::new();
    for url in urls {
        let url = RelayUrl::parse(&url).with_context(|| format!("Invalid relay url {}", url))?;
        let (relay, receiver) = ChannelRelay::new(url.clone());
        relays.push(Arc::new(relay));
        receivers.insert(url, receiver);
    }

    // Replays run on a virtual clock so the grouping window closes immediately
    let timer = Arc::new(ManualTimer::new());
    let manager = SubscriptionManager::builder(settings)
        .with_timer(timer.clone())
        .build();
    let options = SubscriptionOptions {
        close_on_eose: args.close_on_eose,
        use_cache: false,
    };

    let mut subscriptions: Vec<Arc<Subscription>> = Vec::new();
    for _ in 0..args.copies {
        let subscription = manager.subscribe_with(filters.clone(), options)?;
        if args.group {
            manager
                .enqueue_for_grouping(&subscription, relays.clone())
                .await;
        } else {
            manager.start(&subscription, relays.clone()).await;
        }
        subscriptions.push(subscription);
    }
    timer.fire_all();

    let opened = opened_ids(&mut receivers);
    let mut receivers: Vec<_> = subscriptions
        .iter()
        .map(|subscription| (subscription.clone(), subscription.events()))
        .collect();

    let mut outcomes: BTreeMap<String, usize> = BTreeMap::new();
    for line in log {
        let ids = opened.get(&line.relay).map(Vec::as_slice).unwrap_or(&[]);
        for message in retarget(line.message, ids) {
            if let Some(outcome) = manager.handle_relay_message(&line.relay, message).await {
                *outcomes.entry(format!("{:?}", outcome)).or_default() += 1;
            }
        }
    }

    for (subscription, receiver) in receivers.iter_mut() {
        for event in receiver.drain() {
            println!(
                "{}",
                json!({ "subscription": subscription.id().to_string(), "event": &*event })
            );
        }
        info!(
            "[{}] {} event(s), all relays sent EOSE: {}",
            subscription.id(),
            subscription.emitted(),
            subscription.all_relays_eosed() || subscription.is_stopped()
        );
    }
    for (outcome, count) in &outcomes {
        info!("{}: {}", outcome, count);
    }

    manager.shutdown();

    if let Some(handle) = metrics_handle {
        println!("{}", handle.render());
    }

    Ok(())
}
