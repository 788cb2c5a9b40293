use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use proctor_core::api::ApiClient;
use proctor_core::cli::{Cli, Command, PhoneArgs, SessionArgs, StatusArgs};
use proctor_core::config::ProctorConfig;
use proctor_core::pairing::PairingCoordinator;
use proctor_core::signaling::{ConnectParams, Credential, SignalingTransport};
use proctor_core::status::StatusChannel;
use proctor_core::telemetry::logging;
use proctor_core::transport::websocket::WebSocketDialer;
use proctor_core::wire::{EndpointPath, EntityId, PairingToken, Role};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;
    let config = cli.load_config().context("invalid configuration")?;

    match cli.command {
        Command::Status(args) => run_status(config, args).await,
        Command::Monitor(args) => run_monitor(config, args).await,
        Command::Phone(args) => run_phone(config, args).await,
    }
}

async fn run_status(config: ProctorConfig, args: StatusArgs) -> Result<()> {
    let api = ApiClient::new(config.api_url.clone())?;
    let channel = StatusChannel::new(
        config.transport.clone(),
        Arc::new(WebSocketDialer::default()),
        Arc::new(api),
        config.status_settings(),
    );

    let subscriptions: Vec<_> = args
        .event_ids
        .iter()
        .map(|id| {
            channel.subscribe(Some(EntityId::new(id.clone())), |update| {
                println!("{} {}", update.entity_id, update.status);
            })
        })
        .collect();
    info!(target: "proctor", count = subscriptions.len(), "watching events");

    tokio::signal::ctrl_c().await?;
    drop(subscriptions);
    channel.dispose();
    Ok(())
}

async fn run_monitor(config: ProctorConfig, args: SessionArgs) -> Result<()> {
    let path = EndpointPath::new(Role::Primary, args.task_id, args.session_id, args.user_id)?;
    let api = ApiClient::new(config.api_url.clone())?;
    let transport = SignalingTransport::new(
        config.transport.clone(),
        Arc::new(WebSocketDialer::default()),
    );

    transport.on_message(|message| match message.encode() {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("unprintable message: {err}"),
    });
    let pairing = PairingCoordinator::attach(&transport, path.clone(), Arc::new(api));
    transport.connect(ConnectParams::session(path));
    println!("pairing token: {}", pairing.token());
    if let Some(recipient) = args.send_link {
        drop(pairing.request_link(Some(recipient)));
    }

    let mut paired = pairing.watch();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            changed = paired.changed() => {
                if changed.is_err() {
                    break;
                }
                let joined = *paired.borrow_and_update();
                eprintln!("secondary device {}", if joined { "joined" } else { "left" });
            }
        }
    }

    pairing.detach();
    transport.close();
    Ok(())
}

async fn run_phone(config: ProctorConfig, args: PhoneArgs) -> Result<()> {
    let path = EndpointPath::new(Role::Secondary, args.task_id, args.session_id, args.user_id)?;
    let transport = SignalingTransport::new(
        config.transport.clone(),
        Arc::new(WebSocketDialer::default()),
    );
    transport.connect(ConnectParams::session(path).with_credential(Credential {
        passcode: args.passcode,
        pairing_token: args.token.map(PairingToken::from_string),
    }));

    let mut state = transport.watch_state();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                eprintln!("link {current:?}");
            }
        }
    }

    transport.close();
    Ok(())
}
