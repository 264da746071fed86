//! Softphone simulator
//!
//! Drives a [`Softphone`] against the in-memory engine: connects, subscribes
//! to the monitored extensions, feeds them dialog notifications, places a
//! call, holds and hangs it up, then disconnects. Every phone event is logged.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use tokio::time::sleep;
use tracing::{info, warn};

use rvoip_softphone_core::logging::{init_logging, parse_log_level, LoggingConfig};
use rvoip_softphone_core::mock::MockEngine;
use rvoip_softphone_core::{EngineEvent, PhoneConfig, PhoneEvent, RemoteSessionState, Softphone};

#[derive(Parser, Debug)]
#[command(author, version, about = "Call-center softphone simulator", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server URI, overrides the configuration file
    #[arg(short, long)]
    server: Option<String>,

    /// SIP username
    #[arg(short, long, default_value = "1001")]
    username: String,

    /// SIP password
    #[arg(short, long, default_value = "secret")]
    password: String,

    /// Extensions to monitor, comma separated
    #[arg(short, long, value_delimiter = ',', default_value = "201,202")]
    extensions: Vec<String>,

    /// Target of the simulated outbound call
    #[arg(short, long, default_value = "sip:300@pbx.local")]
    dial: String,

    /// Agent id for the login step
    #[arg(long)]
    agent_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,

    /// Print the final line and subscription state as JSON
    #[arg(long)]
    dump_state: bool,
}

fn load_config(args: &Args) -> anyhow::Result<PhoneConfig> {
    let mut config = match &args.config {
        Some(path) => PhoneConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => PhoneConfig::new("wss://pbx.local:8089/ws"),
    };
    if let Some(server) = &args.server {
        config.transport.server_uri = server.clone();
    }
    let mut config = config
        .with_credentials(args.username.clone(), args.password.clone())
        .with_monitored_extensions(args.extensions.iter().cloned());
    if let Some(agent_id) = &args.agent_id {
        config = config.with_agent_id(agent_id.clone());
    }
    config.validate()?;
    Ok(config)
}

fn dialog_info(entity: &str, state: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<dialog-info xmlns="urn:ietf:params:xml:ns:dialog-info" version="1" state="full" entity="{entity}">
  <dialog id="d1"><state>{state}</state></dialog>
</dialog-info>"#
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut logging = LoggingConfig::new(parse_log_level(&args.log_level)?, "softphone-sim");
    if args.json {
        logging = logging.with_json();
    }
    init_logging(&logging)?;

    let config = load_config(&args)?;
    let engine = Arc::new(MockEngine::new());
    let phone = Softphone::builder(config).engine(engine.clone()).build()?;

    let mut events = phone.event_stream();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(PhoneEvent::PresenceChanged { extension, current, .. }) => {
                    info!(extension = %extension, presence = %current, "BLF lamp changed")
                }
                Ok(event) => info!(event = event.name(), "{:?}", event),
                Err(e) => warn!(error = %e, "Event stream lagged"),
            }
        }
    });

    phone.connect().await?;
    sleep(Duration::from_millis(100)).await;

    for (extension, state) in args.extensions.iter().zip(["confirmed", "early", "terminated"].iter().cycle()) {
        engine.emit(EngineEvent::NotificationReceived {
            extension: extension.clone(),
            body: dialog_info(extension, state),
            expires: Some(3600),
            terminated: false,
        });
    }

    if args.agent_id.is_some() {
        match phone.agent_login().await {
            Ok(outcome) => info!(?outcome, "Agent logged in"),
            Err(e) => warn!(error = %e, "Agent login failed"),
        }
    }

    let call = phone.place_call(&args.dial).await?;
    if let Some(session) = engine.last_invited_session() {
        engine.emit(EngineEvent::SessionStateChanged {
            session: session.clone(),
            state: RemoteSessionState::Ringing,
        });
        sleep(Duration::from_millis(200)).await;
        engine.emit(EngineEvent::SessionStateChanged {
            session,
            state: RemoteSessionState::Accepted,
        });
    }
    sleep(Duration::from_millis(200)).await;

    phone.hold(call.line).await?;
    sleep(Duration::from_millis(200)).await;
    phone.hangup(call.line).await?;

    for subscription in phone.subscriptions() {
        info!(
            extension = %subscription.extension,
            status = ?subscription.status,
            presence = %subscription.presence,
            "Subscription"
        );
    }
    if args.dump_state {
        let state = serde_json::json!({
            "lines": phone.lines(),
            "subscriptions": phone.subscriptions(),
            "agent": phone.agent_context(),
        });
        println!("{}", serde_json::to_string_pretty(&state)?);
    }

    phone.disconnect().await?;
    sleep(Duration::from_millis(100)).await;
    drop(phone);
    printer.abort();
    Ok(())
}
