use clap::Parser;
use ssc_peer_lib::bundle::{decode_bundle, encode_bundle, TOKEN_PREFIX};
use ssc_peer_lib::peer::ice::probe_ice_server;
use ssc_peer_lib::peer::messages::MessageStream;
use ssc_peer_lib::peer::types::SignalingEnvelope;
use ssc_peer_lib::{
    logger::init_logging, AppEvent, ConfigError, EventSink, NegotiationMachine, PeerError,
    PeerHandle, RtcTransportFactory, Settings, SignalingClient, SignalingStream, Status,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ssc-peer", about = "Serverless chat over a WebRTC data channel")]
struct Cli {
    #[arg(long, env = "SSC_SIGNALING_URL", help = "Signaling relay (ws:// or wss://)")]
    signal_url: Option<String>,

    #[arg(long, help = "JSON file with the ICE server list")]
    ice_servers: Option<PathBuf>,

    #[arg(long, help = "Exchange ssc: tokens by hand instead of using the relay")]
    manual: bool,

    #[arg(long, help = "Log filter, e.g. debug or ssc_peer_lib=trace")]
    log: Option<String>,

    #[arg(long, help = "Seconds to wait for a dropped link to recover")]
    grace: Option<u64>,

    #[arg(long, help = "Check the configured ICE servers and exit")]
    probe: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };

    if cli.probe {
        for server in &settings.ice_servers {
            let verdict = if probe_ice_server(server).await {
                "ok"
            } else {
                "unreachable"
            };
            println!("{} {verdict}", server.url);
        }
        return ExitCode::SUCCESS;
    }

    run(cli.manual, settings).await;
    ExitCode::SUCCESS
}

fn load_settings(cli: &Cli) -> Result<Settings, ConfigError> {
    let mut settings = Settings::from_env()?;
    if let Some(url) = &cli.signal_url {
        settings.signaling_url = url.clone();
    }
    if let Some(path) = &cli.ice_servers {
        settings.load_ice_servers(path)?;
    }
    if let Some(secs) = cli.grace {
        settings.grace_period = Duration::from_secs(secs);
    }
    settings.validate()?;
    Ok(settings)
}

async fn run(manual: bool, settings: Settings) {
    let (events, app_events) = EventSink::channel();
    let factory = Arc::new(RtcTransportFactory::new(&settings));
    let mut machine = NegotiationMachine::new(factory, events, settings.grace_period);

    let pasted = if manual {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<SignalingEnvelope>();
        let (in_tx, stream) = SignalingStream::channel();
        machine.attach_signaling(Arc::new(out_tx), Some(stream));
        tokio::spawn(print_tokens(out_rx));
        Some(in_tx)
    } else {
        match SignalingClient::connect(&settings.signaling_url).await {
            Ok((client, stream)) => machine.attach_signaling(Arc::new(client), Some(stream)),
            Err(err) => eprintln!("* signaling unavailable ({err}), /retry to reconnect"),
        }
        None
    };

    let (handle, task) = machine.spawn();
    tokio::spawn(print_events(app_events));
    info!(manual, "ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let result = match line {
            "/quit" => break,
            "/find" => handle.find_peer(),
            "/leave" => handle.leave(),
            "/status" => handle.status().await.map(|status| print_status(&status)),
            "/retry" => match pasted {
                None => reconnect(&handle, &settings).await,
                Some(_) => {
                    eprintln!("* no relay in manual mode");
                    Ok(())
                }
            },
            token if token.starts_with(TOKEN_PREFIX) => match &pasted {
                Some(inbound) => match decode_bundle(token) {
                    Ok(envelope) => {
                        let _ = inbound.send(Ok(envelope));
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                },
                None => {
                    eprintln!("* tokens are only read with --manual");
                    Ok(())
                }
            },
            body => handle
                .send_text(body)
                .await
                .map(|message| println!("[{}] me: {}", message.display_time(), message.body)),
        };
        if let Err(err) = result {
            eprintln!("* {err}");
        }
    }

    let _ = handle.shutdown();
    let _ = task.await;
}

async fn reconnect(handle: &PeerHandle, settings: &Settings) -> Result<(), PeerError> {
    let (client, stream) = SignalingClient::connect(&settings.signaling_url).await?;
    handle.attach_signaling(Arc::new(client), stream)
}

fn print_status(status: &Status) {
    println!(
        "* state={:?} local={} remote={} reachable={} signaling={}",
        status.state,
        status.local_id.as_deref().unwrap_or("-"),
        status.remote_id.as_deref().unwrap_or("-"),
        status.reachable,
        status.signaling
    );
}

async fn print_events(mut events: UnboundedReceiver<AppEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::StateChanged(state) => println!("* state: {state:?}"),
            AppEvent::ChannelReady {
                remote_id,
                fingerprint,
                messages,
                ..
            } => {
                println!("* connected to {remote_id}, fingerprint {fingerprint}");
                tokio::spawn(print_messages(messages));
            }
            AppEvent::Disconnected { remote_id } => {
                println!("* {} left", remote_id.as_deref().unwrap_or("peer"))
            }
            AppEvent::ConnectionProblem => println!("* connection problem, waiting to recover"),
            AppEvent::ConnectionRecovered => println!("* connection recovered"),
            AppEvent::NegotiationFailed(reason) => println!("* negotiation failed: {reason}"),
            AppEvent::SignalingLost(reason) => {
                println!("* signaling lost ({reason}), /retry to reconnect")
            }
            AppEvent::SignalingAttached => println!("* signaling connected"),
        }
    }
}

async fn print_messages(mut messages: MessageStream) {
    while let Some(message) = messages.recv().await {
        println!(
            "[{}] {}: {}",
            message.display_time(),
            message.from_id,
            message.body
        );
    }
}

/// Manual mode: every outbound envelope becomes a token to paste on the other side.
async fn print_tokens(mut envelopes: UnboundedReceiver<SignalingEnvelope>) {
    while let Some(envelope) = envelopes.recv().await {
        match encode_bundle(&envelope) {
            Ok(token) => println!("* {} token:\n{token}", envelope.event()),
            Err(err) => eprintln!("* cannot encode {}: {err}", envelope.event()),
        }
    }
}
