use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex},
};

use clap::Parser;
use pumplink_client::{
    ClientError,
    command::{ConsoleCommand, HELP},
    config::{
        ClientConfig, config_dir, config_path, load_config, save_config_with_retry, secrets_path,
    },
    connection::{ConnectionSnapshot, SessionSignal},
    secret_store::FileSecretStore,
    session::Session,
};
use pumplink_core::{
    dial::{DialEngine, DialGeometry, DragUpdate, Point},
    lifecycle::AppPresence,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::watch,
};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Parser, Debug)]
#[command(name = "pumplink", about = "Terminal client for a PumpLink pump controller")]
struct ClientArgs {
    /// Sign in with these credentials instead of the stored refresh credential.
    #[arg(long, requires = "password")]
    email: Option<String>,
    #[arg(long, requires = "email")]
    password: Option<String>,
    /// Create the account given by --email and --password before signing in.
    #[arg(long, requires = "email")]
    register: bool,
    /// Power the device on for this many minutes right after signing in.
    #[arg(long)]
    arm: Option<u32>,
    /// Override and persist the backend API base URL.
    #[arg(long)]
    api_base_url: Option<String>,
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

enum Flow {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = ClientArgs::parse();
    init_logging();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("client exited: {}", err);
            eprintln!("pumplink: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: ClientArgs) -> Result<(), ClientError> {
    let config = resolve_config(args.api_base_url.as_deref())?;
    info!(api_base_url = %config.api_base_url, "pumplink starting");

    let store = Arc::new(FileSecretStore::new(secrets_path()));
    let mut session = Session::new(&config, store)?;

    if args.register
        && let (Some(email), Some(password)) = (args.email.as_deref(), args.password.as_deref())
    {
        let response = session.register(email, password).await?;
        println!("registered: {}", response.message);
    }

    let signed_in = match (args.email.as_deref(), args.password.as_deref()) {
        (Some(email), Some(password)) => session.login(email, password).await,
        _ => session.restore().await,
    };
    match signed_in {
        Ok(()) => println!("signed in"),
        Err(ClientError::LoginRequired) => {
            println!("not signed in; run again with --email and --password");
            return Err(ClientError::LoginRequired);
        }
        Err(err) => return Err(err),
    }

    if let Some(minutes) = args.arm {
        arm(&mut session, minutes).await;
    } else if let Err(err) = session.refresh_status().await {
        warn!("initial status fetch failed: {}", err);
    }

    println!("{HELP}");
    command_loop(&mut session).await;
    session.shutdown().await;
    Ok(())
}

fn resolve_config(api_base_url: Option<&str>) -> Result<ClientConfig, ClientError> {
    let path = config_path();
    let mut config = match load_config(&path) {
        Ok(Some(config)) => config,
        Ok(None) => ClientConfig::default(),
        Err(err) => {
            warn!("ignoring unreadable config {}: {}", path.display(), err);
            ClientConfig::default()
        }
    };

    if let Some(api_base_url) = api_base_url {
        config.api_base_url = api_base_url.trim().to_owned();
        save_config_with_retry(&path, &config).map_err(|err| ClientError::Config(err.to_string()))?;
        info!(path = %path.display(), "saved config");
    }
    Ok(config)
}

async fn command_loop(session: &mut Session<FileSecretStore>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut connection = session.subscribe_connection();
    let mut window = session.subscribe_window();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        warn!("stdin read failed: {}", err);
                        break;
                    }
                };
                if let Flow::Quit = handle_line(session, &line).await {
                    break;
                }
                connection = session.subscribe_connection();
            }
            Some(signal) = session.next_signal() => match signal {
                SessionSignal::LoginRequired => {
                    println!("session expired; run again with --email and --password");
                }
                SessionSignal::StoreFailure(err) => println!("credential store failed: {err}"),
            },
            Some(snapshot) = connection_changed(&mut connection) => {
                println!("connection: {}, power: {}", snapshot.state, snapshot.power);
            }
            Ok(()) = window.changed() => {
                let current = window.borrow_and_update().clone();
                if current.is_armed() {
                    println!("remaining {}", current.label());
                } else {
                    println!("countdown finished");
                }
            }
        }
    }
}

async fn handle_line(session: &mut Session<FileSecretStore>, line: &str) -> Flow {
    let command = match ConsoleCommand::parse(line) {
        Ok(Some(command)) => command,
        Ok(None) => return Flow::Continue,
        Err(msg) => {
            println!("{msg}");
            return Flow::Continue;
        }
    };

    match command {
        ConsoleCommand::Foreground => session.set_presence(AppPresence::Active),
        ConsoleCommand::Background => session.set_presence(AppPresence::Background),
        ConsoleCommand::Arm(minutes) => arm(session, minutes).await,
        ConsoleCommand::Dial(degrees) => dial(session, degrees).await,
        ConsoleCommand::Schedule { start, minutes } => {
            match session.schedule(start, minutes).await {
                Ok(response) => println!("scheduled: {}", response.status),
                Err(err) => println!("schedule failed: {err}"),
            }
        }
        ConsoleCommand::Status => {
            let snapshot = session.connection();
            println!("connection: {}, power: {}", snapshot.state, snapshot.power);
            match session.refresh_status().await {
                Ok(status) => match status.active_until {
                    Some(until) => println!("device {} until {}", status.status, until),
                    None => println!("device {}", status.status),
                },
                Err(err) => println!("status failed: {err}"),
            }
        }
        ConsoleCommand::Logout => match session.logout().await {
            Ok(()) => println!("logged out"),
            Err(err) => println!("logout failed: {err}"),
        },
        ConsoleCommand::Quit => return Flow::Quit,
        ConsoleCommand::Help => println!("{HELP}"),
    }
    Flow::Continue
}

async fn arm(session: &mut Session<FileSecretStore>, minutes: u32) {
    match session.arm(minutes).await {
        Ok(status) => println!("device {} for {minutes} min", status.status),
        Err(err) => println!("arm failed: {err}"),
    }
}

async fn dial(session: &mut Session<FileSecretStore>, degrees: f64) {
    let mut engine = DialEngine::new(DialGeometry::new(Point::default()), ());
    if engine.drag_to(degrees) == DragUpdate::DeadZone {
        println!("{degrees} degrees is past the end of the dial");
        return;
    }
    println!("dial reads {}", engine.label());
    match session.arm_from_dial(&engine).await {
        Ok(status) => println!(
            "device {} for {} min",
            status.status,
            engine.duration_minutes()
        ),
        Err(err) => println!("arm failed: {err}"),
    }
}

/// Resolves with the next snapshot; pending forever once the channel is gone.
async fn connection_changed(
    receiver: &mut Option<watch::Receiver<ConnectionSnapshot>>,
) -> Option<ConnectionSnapshot> {
    let Some(rx) = receiver.as_mut() else {
        return std::future::pending().await;
    };
    if rx.changed().await.is_err() {
        *receiver = None;
        return None;
    }
    Some(*rx.borrow_and_update())
}

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let log_path = client_log_path();
    let file = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .init();
}

fn client_log_path() -> PathBuf {
    let dir = config_dir().join("logs");
    let _ = std::fs::create_dir_all(&dir);
    dir.join("pumplink.log")
}
