mod config;

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, trace, warn};
use tracing_subscriber::EnvFilter;

use logscope_k8s::{Credential, KubeClient};
use logscope_logs::{
    KubeLogSource, OrderedLogStore, Progress, StreamController, StreamError, StreamNotice,
    SubscriptionKey,
};
use logscope_tui::{
    Effect, Event, EventHandler, KeyBindings, KeyContext, LogViewerScreen, Tui, ViewHeader,
    ViewState,
};

use crate::config::Config;

/// logscope - tail the logs of one Kubernetes container
#[derive(Parser, Debug)]
#[command(name = "logscope")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kubernetes context name
    #[arg(value_name = "CONTEXT")]
    context: String,

    #[arg(value_name = "NAMESPACE")]
    namespace: String,

    #[arg(value_name = "POD")]
    pod: String,

    /// Container (defaults to the pod's first container)
    #[arg(value_name = "CONTAINER")]
    container: Option<String>,

    /// Bearer token for the cluster API
    #[arg(long, env = "LOGSCOPE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Config file (default ~/.config/logscope/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Number of historical lines to fetch before following
    #[arg(long)]
    tail_lines: Option<i64>,

    /// Only show logs newer than this (5m, 15m, 30m, 1h, 6h, 24h, all)
    #[arg(long)]
    since: Option<String>,

    /// Load the current logs once instead of following
    #[arg(long)]
    no_follow: bool,

    /// Quiet period in milliseconds before new lines are shown
    #[arg(long)]
    quiescence_ms: Option<u64>,

    /// Write diagnostics here instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(args.log_file.as_deref())?;

    let result = run_app(args).await;
    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }
    result
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            builder.with_writer(Mutex::new(file)).with_ansi(false).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

async fn run_app(args: Args) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(tail_lines) = args.tail_lines {
        config.stream.tail_lines = Some(tail_lines);
    }
    if let Some(since) = &args.since {
        config.stream.since = Some(since.clone());
    }
    if let Some(quiescence_ms) = args.quiescence_ms {
        config.stream.quiescence_ms = quiescence_ms;
    }
    let stream_config = config.stream_config()?;
    let credential = config::resolve_credential(args.token.clone(), &config.auth)?;

    let kube_client = KubeClient::new()?;
    if !kube_client.context_names().contains(&args.context) {
        bail!("Context '{}' not found in kubeconfig", args.context);
    }

    let containers = match &credential {
        Some(credential) => lookup_containers(&kube_client, &args, credential).await,
        None => Vec::new(),
    };
    let container = choose_container(
        args.container.clone(),
        &containers,
        credential.is_some(),
        &args.pod,
    )?;
    let key = SubscriptionKey::new(&args.context, &args.namespace, &args.pod, &container);

    let store = OrderedLogStore::new();
    let mut revisions = store.subscribe();
    let source = Arc::new(KubeLogSource::new(kube_client));
    let (mut controller, mut notices) =
        StreamController::new(source, credential, store.clone(), stream_config);

    let mut state = ViewState::new();
    state.set_containers(containers, &container);

    let mut tui = Tui::new()?;
    let mut events = EventHandler::new(Duration::from_millis(250));
    let keybindings = KeyBindings::new();

    if let Err(e) = open(&mut controller, key, args.no_follow) {
        state.show_message(e.to_string());
    }
    render(&mut tui, &mut state, &controller, &store)?;

    loop {
        let dirty = tokio::select! {
            Some(event) = events.next() => match event {
                Event::Key(key_event) => {
                    let action = if state.search_active {
                        keybindings.get_filter_input_action(&key_event)
                    } else {
                        keybindings.get_action(KeyContext::LogViewer, &key_event)
                    };
                    match action.and_then(|action| state.handle(action)) {
                        Some(Effect::Quit) => break,
                        Some(effect) => {
                            apply_effect(effect, &mut controller, &mut state, &store, args.no_follow)
                        }
                        None => {}
                    }
                    true
                }
                Event::Tick => false,
                Event::Resize(_, _) => true,
                Event::Error(e) => {
                    state.show_message(e);
                    true
                }
            },

            progress = controller.step() => {
                trace!(?progress, "stream step");
                // Buffered lines are not visible until the next flush
                !matches!(progress, Progress::Buffered | Progress::Skipped)
            }

            Some(notice) = notices.recv() => {
                handle_notice(&mut state, notice);
                true
            }

            Ok(()) = revisions.changed() => true,
        };

        if dirty {
            render(&mut tui, &mut state, &controller, &store)?;
        }
    }

    controller.unsubscribe();
    events.shutdown();
    tui.restore()?;
    Ok(())
}

/// Containers of the pod for Tab switching; failure only disables switching
async fn lookup_containers(
    kube_client: &KubeClient,
    args: &Args,
    credential: &Credential,
) -> Vec<String> {
    let lookup = async {
        let client = kube_client
            .client_for_context(&args.context, credential)
            .await?;
        kube_client
            .get_pod(&client, &args.namespace, &args.pod)
            .await
    };

    match lookup.await {
        Ok(pod) => pod.container_names(),
        Err(e) => {
            warn!(error = %format!("{:#}", e), "pod lookup failed");
            Vec::new()
        }
    }
}

/// The container named on the command line, else the pod's first one
fn choose_container(
    given: Option<String>,
    containers: &[String],
    has_credential: bool,
    pod: &str,
) -> Result<String> {
    if let Some(container) = given.or_else(|| containers.first().cloned()) {
        return Ok(container);
    }
    if !has_credential {
        let err = StreamError::Unauthorized("no bearer credential configured".to_string());
        return Err(anyhow::Error::new(err)
            .context("Pass --token or set LOGSCOPE_TOKEN to look up the pod's containers"));
    }
    bail!(
        "No container given and the containers of pod '{}' could not be listed",
        pod
    )
}

/// Follow `key`, or load its history once
fn open(
    controller: &mut StreamController,
    key: SubscriptionKey,
    no_follow: bool,
) -> Result<(), StreamError> {
    if no_follow {
        controller.load_history(key)
    } else {
        controller.subscribe(key)
    }
}

fn apply_effect(
    effect: Effect,
    controller: &mut StreamController,
    state: &mut ViewState,
    store: &OrderedLogStore,
    no_follow: bool,
) {
    let result = match effect {
        Effect::Quit => Ok(()),
        Effect::SwitchContainer(container) => match controller.key() {
            Some(key) => {
                let key = key.with_container(container);
                debug!(key = %key, "switching container");
                open(controller, key, no_follow)
            }
            None => Ok(()),
        },
        Effect::ClearLogs => {
            store.clear();
            Ok(())
        }
        Effect::ExportLogs => {
            match export_logs(controller.key(), store) {
                Ok((count, filename)) => {
                    state.show_message(format!("Exported {} lines to {}", count, filename))
                }
                Err(e) => state.show_message(format!("Export failed: {:#}", e)),
            }
            Ok(())
        }
        Effect::Reconnect if no_follow => match controller.key().cloned() {
            Some(key) => {
                store.clear();
                controller.load_history(key)
            }
            None => Ok(()),
        },
        Effect::Reconnect => controller.reconnect(),
    };

    if let Err(e) = result {
        state.show_message(e.to_string());
    }
}

fn handle_notice(state: &mut ViewState, notice: StreamNotice) {
    debug!(?notice, "stream notice");
    match notice {
        StreamNotice::GaveUp { attempts, .. } => state.show_message(format!(
            "Gave up after {} reconnect attempts, press r to retry",
            attempts
        )),
        StreamNotice::Error {
            error: error @ StreamError::Unauthorized(_),
            ..
        } => state.show_message(error.to_string()),
        StreamNotice::HistoryLoaded {
            records, malformed, ..
        } => {
            if malformed > 0 {
                state.show_message(format!(
                    "Loaded {} lines ({} unparseable skipped)",
                    records, malformed
                ));
            } else {
                state.show_message(format!("Loaded {} lines", records));
            }
        }
        StreamNotice::StateChanged { .. }
        | StreamNotice::Error { .. }
        | StreamNotice::Reconnecting { .. } => {}
    }
}

fn export_logs(key: Option<&SubscriptionKey>, store: &OrderedLogStore) -> Result<(usize, String)> {
    let name = key
        .map(|k| format!("{}_{}", k.pod, k.container))
        .unwrap_or_else(|| "logs".to_string());
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let filename = format!("{}_{}.log", name, timestamp);

    let mut content = store.export_raw();
    if !content.is_empty() {
        content.push('\n');
    }
    fs::write(&filename, content).with_context(|| format!("Failed to write {}", filename))?;
    Ok((store.len(), filename))
}

fn render(
    tui: &mut Tui,
    state: &mut ViewState,
    controller: &StreamController,
    store: &OrderedLogStore,
) -> Result<()> {
    let status = controller.status();
    let header = ViewHeader {
        key: controller.key(),
        status: &status,
        container_count: state.container_count(),
    };
    tui.terminal()
        .draw(|frame| LogViewerScreen::render(frame, state, store, &header))?;
    Ok(())
}
