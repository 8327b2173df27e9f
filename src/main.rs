use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use jk_bridge_core::{
    ambient::{AmbientChat, AmbientChatTick, ChatLinesLoaded, ReloadChatLines, AMBIENT_INTERVAL},
    args::Args,
    chat::{ChatOutbox, ChatRelay, InboundChat, WebhookSink},
    commands::{CommandHandler, CommandRequest, SettingUpdate},
    console::{
        classify::LogEvent,
        tailer::{LogTailer, ReloadTailer, TailerControl},
        LogParser, RawLogLine,
    },
    event_loop::{define_events, EventLoop},
    events::emit_on_timer,
    notifier::Notifier,
    players::PollSnapshot,
    poll::{PlayerPoller, PollFailed, PollTick},
    rcon::RconClient,
    restart::{RestartSettled, RestartTimedOut},
    settings::{self, AppDetails, Settings},
    state::BridgeState,
    vpn::VpnVerdict,
    web::{self, WebState},
};
use tokio::sync::mpsc::unbounded_channel;

mod tracing_setup;

pub const APP: AppDetails<'static> = AppDetails {
    qualifier: "net.jkhub",
    organization: "JKHub",
    application: "JKChatBridge",
};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const RELOAD_INTERVAL: Duration = Duration::from_secs(300);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

define_events!(
    BridgeState,
    Message {
        RawLogLine,
        LogEvent,

        PollTick,
        PollSnapshot,
        PollFailed,

        RestartSettled,
        RestartTimedOut,
        VpnVerdict,

        InboundChat,
        CommandRequest,
        SettingUpdate,

        ReloadTailer,
        AmbientChatTick,
        ReloadChatLines,
        ChatLinesLoaded,
    },
    Handler {
        LogParser,
        Notifier,
        PlayerPoller,
        ChatRelay,
        CommandHandler,
        TailerControl,
        AmbientChat,
    },
);

fn main() -> anyhow::Result<()> {
    let _guard = tracing_setup::init_tracing();

    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(|| {
        Settings::default_file_location(APP).unwrap_or_else(|e| {
            tracing::error!("Failed to find a suitable location to store settings ({e}). Settings will be written to {}", settings::CONFIG_FILE_NAME);
            settings::CONFIG_FILE_NAME.into()
        })
    });
    let mut settings = Settings::load_or_create(config_path)
        .context("Failed to load settings. Please fix any issues mentioned and try again.")?;
    settings.save_ok();

    if let Some(log_base_path) = args.log_base_path {
        tracing::debug!("Set log base path to {log_base_path:?}");
        settings.log_base_path = Some(log_base_path);
    }
    if let Some(web_port) = args.web_port {
        settings.web_port = web_port;
    }

    if settings.rcon_target().is_none() {
        tracing::warn!("RCON settings not configured. Relaying into the game is disabled until they are set.");
    }
    if settings.log_base_path.is_none() {
        tracing::warn!("Log base path not set. Set it with --log-base-path or the settings API.");
    }

    let mut state = BridgeState::new(settings);
    let rcon = Arc::new(RconClient::new());

    // The juicy part of the program
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?
        .block_on(async {
            // Exit handler
            let running = Arc::new(AtomicBool::new(true));
            let r = running.clone();
            tokio::task::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Error with Ctrl+C handler: {e}");
                }
                r.store(false, Ordering::SeqCst);
            });

            let http = reqwest::Client::new();
            let (outbox, outbox_task) = ChatOutbox::spawn(Arc::new(WebhookSink::new(http.clone())));

            // HTTP API
            let (web_state, inbound_chat, command_requests) =
                WebState::new(state.settings.api_token.clone());
            let web_port = state.settings.web_port;
            tokio::task::spawn(async move {
                web::serve(web_port, web_state).await;
            });

            // Server log
            let (log_lines_tx, log_lines) = unbounded_channel::<RawLogLine>();
            let tailer = LogTailer::new(log_lines_tx);

            // Kicks off the tailer and the chat lines
            let (startup_tx, startup) = unbounded_channel::<Message>();
            let _ = startup_tx.send(ReloadTailer.into());
            let _ = startup_tx.send(ReloadChatLines.into());

            let mut event_loop: EventLoop<BridgeState, Message, Handler> = EventLoop::new()
                .add_source(Box::new(startup))
                .add_source(Box::new(log_lines))
                .add_source(Box::new(inbound_chat))
                .add_source(Box::new(command_requests))
                .add_source(emit_on_timer(POLL_INTERVAL, || PollTick).await)
                .add_source(emit_on_timer(RELOAD_INTERVAL, || ReloadTailer).await)
                .add_source(emit_on_timer(AMBIENT_INTERVAL, || AmbientChatTick).await)
                .add_handler(LogParser)
                .add_handler(Notifier::new(rcon.clone(), outbox.clone(), http.clone()))
                .add_handler(PlayerPoller::new(rcon.clone()))
                .add_handler(ChatRelay::new(rcon.clone(), outbox.clone()))
                .add_handler(CommandHandler::new(rcon.clone(), http))
                .add_handler(TailerControl::new(tailer))
                .add_handler(AmbientChat::new(rcon.clone()));
            drop(outbox);

            tracing::info!("Bridge running.");
            loop {
                if !running.load(Ordering::SeqCst) {
                    tracing::info!("Saving and exiting.");
                    event_loop.shutdown(SHUTDOWN_GRACE).await;
                    state.settings.save_ok();
                    break;
                }

                if event_loop.execute_cycle(&mut state).await.is_none() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }

            // Dropping the handlers closes the outbox so it can drain.
            drop(event_loop);
            if tokio::time::timeout(SHUTDOWN_GRACE, outbox_task).await.is_err() {
                tracing::warn!("Gave up on undelivered chat messages.");
            }
        });

    rcon.join();
    Ok(())
}
