use clap::{Arg, ArgAction, Command};
use enumerator::utils::{ensure_dir, log::init_tracing_subscriber};
use enumerator::{Config, Enumeration, Error, Result, Timing};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Command::new(clap::crate_name!())
        .version(clap::crate_version!())
        .about("Enumerate DNS names belonging to a set of target domains")
        .arg(
            Arg::new("domains")
                .help("The root domains to enumerate")
                .value_name("DOMAIN")
                .required(true)
                .num_args(1..),
        )
        .arg(
            Arg::new("passive")
                .short('p')
                .long("passive")
                .action(ArgAction::SetTrue)
                .help("No DNS resolution, passive sources only"),
        )
        .arg(
            Arg::new("active")
                .long("active")
                .action(ArgAction::SetTrue)
                .help("Pull TLS certificates from discovered hosts"),
        )
        .arg(
            Arg::new("brute")
                .short('b')
                .long("brute")
                .action(ArgAction::SetTrue)
                .help("Brute force subdomains with a wordlist"),
        )
        .arg(
            Arg::new("no-alts")
                .long("no-alts")
                .action(ArgAction::SetTrue)
                .help("Disable name alteration generation"),
        )
        .arg(
            Arg::new("no-recursive")
                .long("no-recursive")
                .action(ArgAction::SetTrue)
                .help("Disable recursive expansion of new subdomains"),
        )
        .arg(
            Arg::new("timing")
                .short('t')
                .long("timing")
                .value_name("BAND")
                .value_parser(["paranoid", "sneaky", "polite", "normal", "aggressive", "insane"])
                .default_value("normal")
                .help("Speed band for the enumeration"),
        )
        .arg(
            Arg::new("wordlist")
                .short('w')
                .long("wordlist")
                .value_name("FILE")
                .help("Wordlist file for brute forcing"),
        )
        .arg(
            Arg::new("blacklist")
                .long("blacklist")
                .value_name("NAME")
                .action(ArgAction::Append)
                .help("Names that are never resolved or reported"),
        )
        .arg(
            Arg::new("proxy")
                .long("proxy")
                .value_name("URL")
                .help("HTTP/SOCKS proxy applied to all HTTP operations"),
        )
        .arg(
            Arg::new("data-ops")
                .short('o')
                .long("data-ops")
                .value_name("FILE")
                .help("Mirror every graph mutation to this JSON-lines file"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print discoveries as JSON, one per line"),
        )
        .arg(
            Arg::new("logs")
                .short('s')
                .long("logs")
                .action(ArgAction::SetTrue)
                .help("Save logs into a .log file"),
        )
        .get_matches();

    let domains: Vec<String> = cli
        .get_many::<String>("domains")
        .expect("domains are required")
        .cloned()
        .collect();

    // create output dir for the optional log file
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let output_dir = format!("output/enumerator/{}", domains[0]);
    ensure_dir(output_dir.as_ref())?;

    let save_logs = cli.get_flag("logs");
    init_tracing_subscriber(save_logs, Path::new(&output_dir), &timestamp.to_string());

    let config = Config {
        domains,
        passive: cli.get_flag("passive"),
        active: cli.get_flag("active"),
        brute_forcing: cli.get_flag("brute"),
        alterations: !cli.get_flag("no-alts"),
        recursive: !cli.get_flag("no-recursive"),
        timing: parse_timing(cli.get_one::<String>("timing").expect("has default")),
        wordlist: match cli.get_one::<String>("wordlist") {
            Some(path) => std::fs::read_to_string(path)?
                .lines()
                .map(|word| word.trim().to_string())
                .filter(|word| !word.is_empty())
                .collect(),
            None => Vec::new(),
        },
        blacklist: cli
            .get_many::<String>("blacklist")
            .map(|names| names.cloned().collect())
            .unwrap_or_default(),
        proxy: cli.get_one::<String>("proxy").cloned(),
        data_ops_path: cli.get_one::<String>("data-ops").map(Into::into),
        ..Default::default()
    };

    let json = cli.get_flag("json");
    let enumeration = Arc::new(Enumeration::new(config));
    let mut output = enumeration
        .take_output()
        .ok_or(Error::Config("output channel already taken".into()))?;

    // wind down cleanly on ctrl-c
    {
        let enumeration = Arc::clone(&enumeration);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("{:12} - interrupt received", "SHUTDOWN");
                enumeration.done();
            }
        });
    }

    let runner = {
        let enumeration = Arc::clone(&enumeration);
        tokio::spawn(async move { enumeration.start().await })
    };

    let mut count = 0usize;
    while let Some(discovery) = output.recv().await {
        count += 1;
        if json {
            println!("{}", serde_json::to_string(&discovery)?);
        } else if discovery.addresses.is_empty() {
            println!("{}", discovery.name);
        } else {
            let addrs: Vec<&str> = discovery.addresses.iter().map(|a| a.ip.as_str()).collect();
            println!("{} {}", discovery.name, addrs.join(","));
        }
    }

    match runner.await? {
        Ok(()) => info!("{:12} - {} names discovered", "FINISHED", count),
        Err(err) => {
            error!("{:12} - {}", "FAILED", err);
            return Err(err);
        }
    }

    Ok(())
}

fn parse_timing(band: &str) -> Timing {
    match band {
        "paranoid" => Timing::Paranoid,
        "sneaky" => Timing::Sneaky,
        "polite" => Timing::Polite,
        "aggressive" => Timing::Aggressive,
        "insane" => Timing::Insane,
        _ => Timing::Normal,
    }
}
