use std::path::PathBuf;
use std::process;

use clap::Parser;
use qkd_kme::config::{Cli, Settings};

/// Loads and validates a `settings.json` without starting the gateway,
/// for use in a deploy pipeline before a KME process is rolled out.
#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validates a KME settings.json file")]
struct Args {
    #[arg(short, long, default_value = "settings.json")]
    settings: PathBuf,
}

fn main() {
    let args = Args::parse();

    let cli = Cli {
        port: 0,
        reload: false,
        settings: args.settings.clone(),
    };

    match Settings::load(&cli) {
        Ok(settings) => {
            println!("{} is valid", args.settings.display());
            println!("id: {}", settings.id);
            println!("role: {}", if settings.is_master { "master" } else { "slave" });
            println!(
                "key size range: [{}, {}], default {}",
                settings.min_key_size, settings.max_key_size, settings.default_key_size
            );
            println!("attached kmes: {}", settings.attached_kmes.len());
            println!("attached saes: {}", settings.attached_saes.len());
            println!("attached trusted nodes: {}", settings.attached_trusted_nodes.len());
        }
        Err(e) => {
            eprintln!("{} is invalid: {}", args.settings.display(), e);
            process::exit(1);
        }
    }
}
