// bitshare daemon: local control, LAN discovery and transfer-announce listeners.

use std::sync::Arc;

use bitshare_daemon::{config, shutdown, Daemon};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: bitshare [-D | --daemon] [-V | --version]

  -D, --daemon     start the bitshare daemon
  -V, --version    print version";

fn main() -> anyhow::Result<()> {
    let mut run_daemon = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("bitshare {}", VERSION);
                return Ok(());
            }
            "--daemon" | "-D" => run_daemon = true,
            _ => {
                eprintln!("unknown argument: {arg}\n\n{USAGE}");
                std::process::exit(2);
            }
        }
    }
    if !run_daemon {
        println!("{USAGE}");
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let cfg = config::load();
    let daemon = Arc::new(Daemon::new(cfg));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let signal_daemon = daemon.clone();
        tokio::spawn(async move {
            match shutdown::on_interrupts(shutdown::interrupt, || signal_daemon.stop()).await {
                Ok(()) => {
                    tracing::warn!("second interrupt; exiting without waiting for listeners");
                    std::process::exit(130);
                }
                Err(e) => tracing::error!(error = %e, "cannot install signal handler"),
            }
        });
        daemon.start().await
    })?;
    println!("bitshare daemon stopped");
    Ok(())
}
