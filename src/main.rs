//! sync-watch - Binary Entry Point
//!
//! Binds each collection given on the command line and prints the
//! invalidations and notifications the sync core produces, until Ctrl+C.
//!
//! ```text
//! sync-watch tickets projects:create
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use realtime_sync::{
    query_key, ChannelSink, ConnectionState, ConsumerBinding, EventFilter, NotifyTemplates,
    SinkEvent, SubscriptionKey, SyncConfig, SyncEngine,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const USAGE: &str = "usage: sync-watch <collection[:create|update|delete]>...";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("realtime_sync=debug,info")),
        )
        .init();

    let keys = match parse_keys(std::env::args().skip(1)) {
        Ok(keys) if !keys.is_empty() => keys,
        Ok(_) => {
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
        Err(e) => {
            eprintln!("{}\n{}", e, USAGE);
            return ExitCode::from(2);
        }
    };

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || on_signal.cancel()) {
        error!(error = %e, "Failed to install Ctrl+C handler");
        return ExitCode::FAILURE;
    }

    watch(config, keys, cancel).await
}

/// Parse `collection[:event]` arguments into subscription keys
fn parse_keys<I>(args: I) -> Result<Vec<SubscriptionKey>, String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .map(|arg| {
            let (collection, filter) = match arg.split_once(':') {
                Some((collection, event)) => {
                    let filter = EventFilter::parse(event)
                        .ok_or_else(|| format!("unknown event {:?} in {:?}", event, arg))?;
                    (collection.to_string(), filter)
                }
                None => (arg.clone(), EventFilter::Any),
            };
            if collection.is_empty() {
                return Err(format!("missing collection in {:?}", arg));
            }
            Ok(SubscriptionKey::new(collection).with_filter(filter))
        })
        .collect()
}

async fn watch(config: SyncConfig, keys: Vec<SubscriptionKey>, cancel: CancellationToken) -> ExitCode {
    let (sink, mut signals) = ChannelSink::new();
    let sink = Arc::new(sink);
    let engine = SyncEngine::builder(config)
        .invalidator(sink.clone())
        .notifier(sink.clone())
        .diagnostics(sink)
        .build();

    engine.on_state_change(|change| {
        info!(from = %change.from, to = %change.to, epoch = change.epoch, "Connection {}", change.to);
    });

    if let Err(e) = engine.start().await {
        warn!(error = %e, "Initial connect failed; retrying in background");
    }

    // bindings need an open connection
    let mut state = engine.connection().watch_state();
    loop {
        if state.borrow_and_update().state == ConnectionState::Open {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                engine.shutdown().await;
                return ExitCode::SUCCESS;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    engine.shutdown().await;
                    return ExitCode::FAILURE;
                }
            }
        }
    }

    let mut bindings = Vec::with_capacity(keys.len());
    for key in keys {
        let binding = ConsumerBinding::new(key.clone())
            .query_key(query_key![key.resource_kind.as_str()])
            .templates(NotifyTemplates::defaults_for(&key.resource_kind));
        match engine.bind(binding).await {
            Ok(binding) => {
                info!(key = %key, "Watching");
                bindings.push(binding);
            }
            Err(e) => error!(key = %key, error = %e, "Cannot watch"),
        }
    }

    if bindings.is_empty() {
        engine.shutdown().await;
        return ExitCode::FAILURE;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(SinkEvent::Invalidate { query_key }) => info!(query_key = %query_key, "Invalidate"),
                Some(SinkEvent::Notify { message, severity }) => println!("[{}] {}", severity, message),
                Some(SinkEvent::Diagnostic { diagnostic }) => warn!("{}", diagnostic),
                None => break,
            },
        }
    }

    info!("Shutting down");
    for binding in bindings {
        binding.release().await;
    }
    engine.shutdown().await;
    ExitCode::SUCCESS
}
