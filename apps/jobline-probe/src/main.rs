mod config;
mod logging;

use std::{
    process,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use jobline_core::{
    ConnectionState, DispatchOptions, LiveUpdateChannel, Method, RequestDispatcher, Subscription,
    event_types,
};
use jobline_net::{HttpTransport, WsConnector};
use jobline_platform::{DiagnosticsSink, ScopedDiagnostics, TracingDiagnostics};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::ProbeConfig;

/// Why the probe pulls the endpoint again.
#[derive(Debug)]
enum Refresh {
    Event(String),
    Reconnected,
}

#[tokio::main]
async fn main() {
    logging::init();

    let config = match ProbeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            process::exit(2);
        }
    };

    let transport = match HttpTransport::new(config.api_base_url.clone(), config.request_timeout) {
        Ok(transport) => transport,
        Err(err) => {
            error!(error = %err, "failed to build http transport");
            process::exit(1);
        }
    };
    let diagnostics: Arc<dyn DiagnosticsSink> =
        Arc::new(ScopedDiagnostics::new(TracingDiagnostics, "probe"));
    let dispatcher =
        RequestDispatcher::with_config(Arc::new(transport), config.dispatcher_config())
            .with_diagnostics(diagnostics.clone());

    info!(base = %config.api_base_url, endpoint = %config.probe_endpoint, "probe starting");
    let pulled = pull(&dispatcher, &config).await;
    let Some(port) = config.live_port else {
        info!("JOBLINE_LIVE_PORT not set; live channel disabled, exiting after one pull");
        if !pulled {
            process::exit(1);
        }
        return;
    };

    let channel = LiveUpdateChannel::with_diagnostics(
        config.live_channel_config(),
        Arc::new(WsConnector::new()),
        diagnostics,
    );
    let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel();
    let _subscriptions = subscribe(&channel, &refresh_tx);

    if let Err(err) = channel.connect(Some(port)) {
        error!(error = %err, "failed to start live channel");
        process::exit(1);
    }

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "ctrl-c handler failed; shutting down");
                }
                break;
            }
            Some(reason) = refresh_rx.recv() => {
                info!(?reason, "re-pulling after live update");
                dispatcher.invalidate(Method::Get, &config.probe_endpoint, None);
                pull(&dispatcher, &config).await;
            }
        }
    }

    info!("shutting down");
    channel.disconnect();
    dispatcher.clear_cache();
}

fn subscribe(
    channel: &LiveUpdateChannel,
    refresh_tx: &mpsc::UnboundedSender<Refresh>,
) -> Vec<Subscription> {
    let mut subscriptions = Vec::new();

    let tx = refresh_tx.clone();
    let was_reconnecting = Arc::new(AtomicBool::new(false));
    subscriptions.push(channel.on_state_change(move |state| {
        match state {
            ConnectionState::Connected => {
                info!("live channel connected");
                if was_reconnecting.swap(false, Ordering::SeqCst) {
                    let _ = tx.send(Refresh::Reconnected);
                }
            }
            ConnectionState::Reconnecting => {
                was_reconnecting.store(true, Ordering::SeqCst);
                warn!("live channel lost; reconnecting");
            }
            ConnectionState::Disconnected => {
                warn!("live channel disconnected");
            }
            ConnectionState::Connecting => {}
        }
        Ok(())
    }));

    for event_type in [event_types::JOB_STATUS, event_types::MODEL_STATE] {
        let tx = refresh_tx.clone();
        subscriptions.push(channel.on(event_type, move |event| {
            tx.send(Refresh::Event(event.event_type.clone()))
                .map_err(|err| err.to_string().into())
        }));
    }

    subscriptions.push(channel.on(event_types::JOB_PROGRESS, |event| {
        info!(payload = %event.payload, "job progress");
        Ok(())
    }));

    subscriptions
}

/// Pull the probe endpoint through the cache and retry policy.
async fn pull(dispatcher: &RequestDispatcher, config: &ProbeConfig) -> bool {
    let options = DispatchOptions::default()
        .cache_ttl(config.probe_cache_ttl)
        .retry(config.retry.clone());
    match dispatcher.get(&config.probe_endpoint, options).await {
        Ok(value) => {
            let rendered =
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
            println!("{rendered}");
            true
        }
        Err(err) => {
            warn!(
                code = %err.code,
                status = ?err.status,
                message = %err.message,
                "pull failed"
            );
            false
        }
    }
}
