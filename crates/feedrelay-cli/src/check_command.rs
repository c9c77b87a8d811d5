use {
    anyhow::{Context, bail},
    feedrelay_channels::{LockFile, LockStatus},
    feedrelay_core::{Config, RoutingTable},
    std::fmt::Write,
};

/// Validate everything `run` needs before it touches the network.
///
/// The configuration itself was already validated while loading.
pub fn check(config: &Config) -> anyhow::Result<()> {
    println!("Configuration OK");

    match &config.bot_token_file {
        Some(path) => {
            let token = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read credential file {:?}", path))?;
            if token.trim().is_empty() {
                bail!("Credential file {:?} is empty", path);
            }
            println!("Credential file: {:?}", path);
        },
        None => println!("Credential file: not configured (chat source disabled)"),
    }

    let lock = LockFile::new(config.lock_path());
    match lock.status()? {
        LockStatus::Absent => println!("Lock: free ({:?})", lock.path()),
        LockStatus::Stale(reason) => println!("Lock: stale, will be reclaimed ({})", reason),
        LockStatus::Held(record) => println!("Lock: held by running pid {}", record.pid),
    }

    println!(
        "Sources: {} feeds, {} APIs, daily summary at {} {}",
        config.feeds.len(),
        config.apis.len(),
        config.daily_summary_time,
        config.daily_summary_tz
    );
    print!("{}", render_routes(&config.routing_table()));
    Ok(())
}

fn render_routes(table: &RoutingTable) -> String {
    let mut routes: Vec<(&str, &str)> = table.iter().collect();
    routes.sort_unstable();

    let mut out = String::from("Routing:\n");
    for (origin, destination) in routes {
        let _ = writeln!(out, "  {} -> {}", origin, destination);
    }
    let _ = writeln!(out, "  * -> {}", table.default_destination());
    out
}
