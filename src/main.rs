use clap::Parser;
use otala_runc::{payload, supervisor, Cli, Commands};

fn main() {
    // The re-exec'd container half never goes through clap: it keeps the
    // whole command line untouched across /proc/self/exe round trips.
    if std::env::args().nth(1).as_deref() == Some("child") {
        init_logging("info");
        if let Err(err) = payload::run() {
            fail("child", &err);
        }
        return;
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_logging(&args.log_level);
            if let Err(err) = color_eyre::install() {
                eprintln!("[❌] setup: {err}");
                std::process::exit(1);
            }

            let config = match args.into_config() {
                Ok(config) => config,
                Err(err) => fail("config", &err),
            };

            log::info!("Starting container bring-up");
            match supervisor::run(config) {
                Ok(code) => std::process::exit(code),
                Err(err) => fail("run", &err),
            }
        }
    }
}

/// RUST_LOG wins over --log-level when both are set.
fn init_logging(default_level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

fn fail(stage: &str, err: &eyre::Report) -> ! {
    eprintln!("[❌] {stage}: {err:#}");
    std::process::exit(1);
}
