//! Corridor - a programmable L4/L7 tunneling gateway

use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use corridor::app::Runtime;
use corridor::config::Config;
use corridor::error::Result;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        println!(
            "{}",
            serde_json::to_string_pretty(&Config::example()).expect("serialize example config")
        );
        return Ok(());
    }

    // Load configuration
    let config = if let Some(path) = &args.config {
        Config::load(path)?
    } else {
        Config::example()
    };

    // Initialize logging: RUST_LOG wins over the config level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }

    if args.config.is_none() {
        info!("No config file specified, using the built-in example");
    }
    info!("Corridor v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::from_config(&config).await?;
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    gen_config: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut gen_config = false;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            gen_config,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Corridor - a programmable L4/L7 tunneling gateway

USAGE:
    corridor [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config            Print an example configuration
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    corridor -c gateway.json
    corridor --gen-config > gateway.json
    RUST_LOG=debug corridor -c gateway.json
"#
    );
}

fn print_version() {
    println!("Corridor v{}", env!("CARGO_PKG_VERSION"));
    println!("A programmable L4/L7 tunneling gateway");
}
