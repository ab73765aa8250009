#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # smsgwd
//!
//! SMS gateway daemon for a serial GSM modem.
//!
//! smsgwd drives the modem's AT command interface from two dedicated I/O
//! threads, accepts outbound send requests from local clients (a named pipe
//! and an optional Unix socket), and reacts to inbound SMS by
//! authenticating the sender against the users file and dispatching
//! built-in or externally-spawned commands, replying by SMS.
//!
//! Signals: SIGHUP reloads the users and commands files, SIGTERM shuts
//! down gracefully, SIGINT exits immediately with status 1.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nix::sys::stat::Mode;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use smsgwd::channel::{self, PromptGate, ResponseSlot};
use smsgwd::{CommandTable, Config, Dispatcher, Gateway, UserDb};

/// SMS gateway daemon for a serial GSM modem.
#[derive(Parser)]
#[command(name = "smsgwd", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// Serial device, overriding the config file.
    device: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref());
    if let Some(device) = cli.device {
        config.serial.device = device;
    }

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    // Validate config before proceeding
    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("smsgwd v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Modem device: {} at {} baud",
        config.serial.device, config.serial.baud
    );

    let autologout = config.autologout_interval().ok().flatten();
    if let Some(interval) = autologout {
        info!("Autologout after {interval:?} of inactivity");
    }

    if let Some(fifo) = &config.paths.fifo {
        match nix::unistd::mkfifo(fifo.as_str(), Mode::from_bits_truncate(0o660)) {
            Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => {
                error!("mkfifo {fifo}: {e}");
                std::process::exit(1);
            }
        }
    }

    let (reader, mut writer, wake) =
        match smsgwd::serial::open(&config.serial.device, config.serial.baud) {
            Ok(parts) => parts,
            Err(e) => {
                error!("Serial open failed: {e}");
                std::process::exit(1);
            }
        };

    // An ESC clears any payload prompt a previous run may have left the
    // modem stuck in; give it a moment to settle.
    if let Err(e) = writer.write_all(&[0x1B]).and_then(|()| writer.flush()) {
        error!("Serial write failed: {e}");
        std::process::exit(1);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let users = Arc::new(UserDb::new(autologout));
    if let Some(path) = &config.paths.users_file {
        if let Err(e) = users.load(path) {
            error!("Users file: {e}");
            std::process::exit(1);
        }
    }

    let commands = Arc::new(CommandTable::new());
    if let Some(path) = &config.paths.commands_file {
        if let Err(e) = commands.load(path) {
            error!("Commands file: {e}");
            std::process::exit(1);
        }
    }

    let (tx, queue_rx) = mpsc::unbounded_channel();
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let slot = Arc::new(ResponseSlot::new());
    let prompt = Arc::new(PromptGate::new());
    let abort = Arc::new(AtomicBool::new(false));

    let gateway = Gateway::new(tx, Arc::clone(&users));
    let dispatcher = Dispatcher::new(Arc::clone(&users), Arc::clone(&commands), gateway.clone());

    let xmit_thread = {
        let slot = Arc::clone(&slot);
        let prompt = Arc::clone(&prompt);
        let fatal = fatal_tx.clone();
        let prompt_timeout = Duration::from_millis(config.modem.prompt_timeout_ms);
        std::thread::Builder::new()
            .name("sms-xmit".into())
            .spawn(move || {
                channel::transmit_loop(queue_rx, slot, prompt, writer, prompt_timeout, fatal);
            })
            .expect("spawn transmitter thread")
    };

    let recv_thread = {
        let slot = Arc::clone(&slot);
        let prompt = Arc::clone(&prompt);
        let abort = Arc::clone(&abort);
        let gateway = gateway.clone();
        let fatal = fatal_tx.clone();
        std::thread::Builder::new()
            .name("sms-recv".into())
            .spawn(move || {
                channel::receive_loop(
                    reader,
                    slot,
                    prompt,
                    gateway,
                    abort,
                    fatal,
                    move |text, phone, date| dispatcher.run_message(text, phone, date),
                );
            })
            .expect("spawn receiver thread")
    };

    let autologout_thread = users.start_autologout({
        let gateway = gateway.clone();
        move |phone| {
            let _ = gateway.send_sms(phone, "Autologout\r(Inactivity)");
        }
    });

    // Startup AT sequence: PIN first, then the wire charset, then drain
    // whatever accumulated in the SIM while we were down.
    if let Some(pin) = &config.modem.pin {
        let _ = gateway.send_pin(pin);
    }
    let _ = gateway.select_charset(&config.modem.charset);
    let _ = gateway.list_stored("ALL");

    let _fifo_thread = config.paths.fifo.clone().map(|fifo| {
        let gateway = gateway.clone();
        std::thread::Builder::new()
            .name("sms-fifo".into())
            .spawn(move || smsgwd::ingress::fifo_loop(fifo, gateway))
            .expect("spawn fifo thread")
    });

    let _socket_task = config
        .paths
        .socket
        .clone()
        .map(|socket| tokio::spawn(smsgwd::ingress::socket_loop(socket, gateway.clone())));

    info!("Gateway ready");

    let mut sighup = signal(SignalKind::hangup()).expect("register SIGHUP");
    let mut sigterm = signal(SignalKind::terminate()).expect("register SIGTERM");
    let mut sigint = signal(SignalKind::interrupt()).expect("register SIGINT");

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP: reloading tables");
                if let Some(path) = &config.paths.commands_file {
                    if let Err(e) = commands.load(path) {
                        warn!("Commands reload failed, keeping previous table: {e}");
                    }
                }
                if let Some(path) = &config.paths.users_file {
                    if let Err(e) = users.load(path) {
                        warn!("Users reload failed, keeping previous table: {e}");
                    }
                }
            }
            _ = sigterm.recv() => {
                info!("SIGTERM: shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT: exiting");
                gateway.shutdown();
                std::process::exit(1);
            }
            Some(err) = fatal_rx.recv() => {
                error!("Modem channel failed: {err}");
                std::process::exit(1);
            }
        }
    }

    // Cooperative teardown: the sentinel stops the transmitter after its
    // current message, the wake pipe unblocks the receiver's poll, and the
    // closed slot unparks whichever side is waiting on the other.
    abort.store(true, Ordering::SeqCst);
    gateway.shutdown();
    slot.shutdown();
    wake.wake();
    users.stop_autologout();

    let _ = xmit_thread.join();
    let _ = recv_thread.join();
    if let Some(handle) = autologout_thread {
        let _ = handle.join();
    }

    info!("Goodbye");
}
