use clap::Parser;
use pumplink_devserver::{AppState, DevAccount, serve};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "pumplink-devserver")]
struct DevServerArgs {
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind_address: String,
    #[arg(long, default_value = "dev@pumplink.local")]
    email: String,
    #[arg(long, default_value = "pumplink")]
    password: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = DevServerArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    info!(email = %args.email, "dev server starting on {}", args.bind_address);
    let state = AppState::new(DevAccount {
        email: args.email,
        password: args.password,
    });
    if let Err(err) = serve(listener, state).await {
        warn!("dev server exited: {}", err);
    }
}
