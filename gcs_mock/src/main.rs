use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use gcs_mock::{MockController, MockDialect, Profile};

/// Simulated PI GCS controller for testing gcs_client without hardware.
#[derive(Parser, Debug)]
#[command(name = "gcs-mock", version)]
struct Args {
    /// Address to listen on (PI controllers use port 50000).
    #[arg(long, default_value = "127.0.0.1:50000")]
    listen: String,

    /// Protocol generation to simulate.
    #[arg(long, value_enum, default_value_t = MockDialect::Gcs30)]
    dialect: MockDialect,

    /// TOML profile; overrides --dialect.
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Print the controller state as JSON when the server stops.
    #[arg(long)]
    dump_state: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let profile = match &args.profile {
        Some(path) => Profile::from_path(path)?,
        None => match args.dialect {
            MockDialect::Gcs2 => Profile::gcs2(),
            MockDialect::Gcs30 => Profile::gcs30(),
        },
    };
    tracing::info!(idn = %profile.idn, "starting mock controller");
    let ctl = MockController::new(profile);
    tokio::select! {
        r = ctl.run(&args.listen) => r?,
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }
    if args.dump_state {
        println!("{}", serde_json::to_string_pretty(&ctl.snapshot())?);
    }
    Ok(())
}
