use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};

use banwarden::config::Config;
use banwarden::filter::PatternMatcher;
use banwarden::ipc::{BanRequest, IpcClient, IpcMessage, ListBansRequest, UnbanRequest};
use banwarden::models::{BanRecord, DaemonStatus, LogRecord, MatchKind};
use banwarden::store::BanStore;
use banwarden::supervisor::{process_alive, read_pid_file, Supervisor};

#[derive(Parser)]
#[command(name = "banwarden")]
#[command(author, version, about = "Log-driven intrusion prevention daemon")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop,

    /// Show daemon and jail status
    Status {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Ban an address in a jail
    Ban {
        /// IP address to ban
        ip: IpAddr,

        /// Jail to ban in
        #[arg(short, long)]
        jail: String,
    },

    /// Lift a ban
    Unban {
        /// IP address to unban
        ip: IpAddr,

        /// Only this jail (default: every jail holding the address)
        #[arg(short, long)]
        jail: Option<String>,

        /// Also forget the ban history used for escalation
        #[arg(long)]
        forget: bool,
    },

    /// List active bans
    List {
        /// Only bans of this jail
        #[arg(short, long)]
        jail: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = ListFormat::Table)]
        format: ListFormat,
    },

    /// Reload the configuration of the running daemon
    Reload,

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a pattern set over a log file without banning anything
    TestFilter {
        /// Filter name (built-in or from the configuration)
        filter: String,

        /// Log file to read
        logfile: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ListFormat {
    Table,
    Json,
    Simple,
}

/// Table row for ban list
#[derive(Tabled)]
struct BanRow {
    #[tabled(rename = "Jail")]
    jail: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "Reason")]
    reason: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Expires")]
    expires: String,
    #[tabled(rename = "Count")]
    count: u32,
    #[tabled(rename = "Enforced")]
    enforced: String,
}

/// Table row for jail status
#[derive(Tabled)]
struct JailRow {
    #[tabled(rename = "Jail")]
    jail: String,
    #[tabled(rename = "Filter")]
    filter: String,
    #[tabled(rename = "Log")]
    log: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Lines")]
    lines: u64,
    #[tabled(rename = "Failures")]
    failures: u64,
    #[tabled(rename = "Watched")]
    watched: usize,
    #[tabled(rename = "Bans")]
    bans: usize,
}

/// Table row for filter test results
#[derive(Tabled)]
struct CountRow {
    #[tabled(rename = "Match")]
    key: String,
    #[tabled(rename = "Hits")]
    hits: usize,
}

/// Log level from the configuration file, if one can be read
pub fn configured_log_level(cli: &Cli) -> Option<String> {
    let config = match &cli.config {
        Some(path) => Config::load(path).ok()?,
        None => Config::load_or_default().ok()?.0,
    };
    Some(config.general.log_level)
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let (config, config_path) = match &cli.config {
        Some(path) => (Config::load(path)?, Some(path.clone())),
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::Start => cmd_start(config, config_path).await,
        Commands::Stop => cmd_stop(config).await,
        Commands::Status { json } => cmd_status(config, json).await,
        Commands::Ban { ip, jail } => cmd_ban(config, ip, jail).await,
        Commands::Unban { ip, jail, forget } => cmd_unban(config, ip, jail, forget).await,
        Commands::List { jail, format } => cmd_list(config, jail, format).await,
        Commands::Reload => cmd_reload(config).await,
        Commands::GenConfig { output } => cmd_gen_config(output),
        Commands::TestFilter { filter, logfile } => cmd_test_filter(config, filter, logfile),
    }
}

async fn cmd_start(config: Config, config_path: Option<PathBuf>) -> Result<()> {
    match &config_path {
        Some(path) => println!("Starting banwarden with {}...", path.display()),
        None => println!("Starting banwarden with built-in defaults..."),
    }

    let supervisor = Supervisor::open(config, config_path)?;
    supervisor.run().await
}

async fn connect(config: &Config) -> Result<IpcClient> {
    IpcClient::connect(config.socket_path())
        .await
        .context("Is the daemon running?")
}

async fn cmd_stop(config: Config) -> Result<()> {
    if let Ok(mut client) = IpcClient::connect(config.socket_path()).await {
        client.call(&IpcMessage::Stop).await?;
        println!("{}", "Daemon is stopping".green().bold());
        return Ok(());
    }

    // No control socket; fall back to the PID file
    let pid_path = config.pid_path();
    let Some(pid) = read_pid_file(&pid_path) else {
        println!("Daemon is not running (no PID file found)");
        return Ok(());
    };

    if !process_alive(pid) {
        println!("Daemon is not running (stale PID file for {})", pid);
        std::fs::remove_file(&pid_path)?;
        return Ok(());
    }

    // Send SIGTERM
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        println!("Sent stop signal to daemon (PID {})", pid);
    } else {
        anyhow::bail!(
            "Failed to signal PID {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }

    Ok(())
}

async fn cmd_status(config: Config, json: bool) -> Result<()> {
    let status = match IpcClient::connect(config.socket_path()).await {
        Ok(mut client) => match client.call(&IpcMessage::Status).await? {
            IpcMessage::StatusResponse(status) => Some(status),
            other => anyhow::bail!("Unexpected response: {:?}", other),
        },
        Err(_) => None,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    match status {
        Some(status) => print_status(&status),
        None => println!("{}", "Daemon Status: STOPPED".red().bold()),
    }
    Ok(())
}

fn print_status(status: &DaemonStatus) {
    println!("{}", "Daemon Status: RUNNING".green().bold());
    println!("PID:          {}", status.pid);
    println!("Uptime:       {}s", status.uptime_secs);
    println!("Backend:      {}", status.backend);
    println!("Active bans:  {}", status.active_bans);
    if status.degraded_bans > 0 {
        println!(
            "{}",
            format!("Degraded:     {} bans not enforced", status.degraded_bans)
                .yellow()
                .bold()
        );
    }

    if !status.jails.is_empty() {
        let rows: Vec<JailRow> = status
            .jails
            .iter()
            .map(|j| JailRow {
                jail: j.jail_id.clone(),
                filter: j.filter.clone(),
                log: j.log_path.clone(),
                source: j.source.to_string(),
                lines: j.counters.lines_seen,
                failures: j.counters.failures,
                watched: j.watched,
                bans: j.active_bans,
            })
            .collect();
        println!("\n{}", Table::new(rows));
    }

    for (jail, err) in &status.failed_jails {
        println!("{} {}: {}", "Failed jail".red().bold(), jail, err);
    }
}

async fn cmd_ban(config: Config, ip: IpAddr, jail: String) -> Result<()> {
    let mut client = connect(&config).await?;

    match client.call(&IpcMessage::Ban(BanRequest { jail, ip })).await? {
        IpcMessage::BanResponse(ban) => {
            println!(
                "{} {} in {} ({})",
                "Banned:".green().bold(),
                ban.address,
                ban.jail_id,
                expiry_text(&ban)
            );
            if !ban.enforced {
                println!(
                    "{} the backend has not confirmed the block yet",
                    "Warning:".yellow().bold()
                );
            }
            Ok(())
        }
        other => anyhow::bail!("Unexpected response: {:?}", other),
    }
}

async fn cmd_unban(config: Config, ip: IpAddr, jail: Option<String>, forget: bool) -> Result<()> {
    let mut client = connect(&config).await?;

    match client
        .call(&IpcMessage::Unban(UnbanRequest { jail, ip, forget }))
        .await?
    {
        IpcMessage::UnbanResponse(resp) if resp.jails.is_empty() => {
            println!("{} {} was not banned", "Note:".yellow().bold(), ip);
            Ok(())
        }
        IpcMessage::UnbanResponse(resp) => {
            println!(
                "{} {} ({})",
                "Unbanned:".green().bold(),
                ip,
                resp.jails.join(", ")
            );
            Ok(())
        }
        other => anyhow::bail!("Unexpected response: {:?}", other),
    }
}

async fn cmd_list(config: Config, jail: Option<String>, format: ListFormat) -> Result<()> {
    let bans = match IpcClient::connect(config.socket_path()).await {
        Ok(mut client) => {
            match client
                .call(&IpcMessage::ListBans(ListBansRequest { jail }))
                .await?
            {
                IpcMessage::BansResponse(resp) => resp.bans,
                other => anyhow::bail!("Unexpected response: {:?}", other),
            }
        }
        // Daemon not running: read the store directly
        Err(_) => {
            let store = BanStore::open(config.db_path())?;
            match jail {
                Some(jail) => store.list_for_jail(&jail)?,
                None => store.list_active()?,
            }
        }
    };

    if bans.is_empty() && format != ListFormat::Json {
        println!("No active bans");
        return Ok(());
    }

    match format {
        ListFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&bans)?);
        }
        ListFormat::Simple => {
            for ban in &bans {
                println!("{}", ban.address);
            }
        }
        ListFormat::Table => {
            let rows: Vec<BanRow> = bans
                .iter()
                .map(|b| BanRow {
                    jail: b.jail_id.clone(),
                    ip: b.address.to_string(),
                    reason: b.reason.clone(),
                    source: b.source.to_string(),
                    expires: b
                        .expires_at
                        .map(|e| e.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".to_string()),
                    count: b.ban_count,
                    enforced: if b.enforced {
                        "yes".to_string()
                    } else {
                        "DEGRADED".to_string()
                    },
                })
                .collect();

            println!("{}", Table::new(rows));
        }
    }

    Ok(())
}

async fn cmd_reload(config: Config) -> Result<()> {
    let mut client = connect(&config).await?;

    match client.call(&IpcMessage::Reload).await? {
        IpcMessage::ReloadResponse(report) => {
            println!(
                "{} {} started, {} stopped, {} unchanged",
                "Reloaded:".green().bold(),
                report.started.len(),
                report.stopped.len(),
                report.unchanged
            );
            for jail in &report.kept {
                println!(
                    "{} {} keeps its previous configuration",
                    "Note:".yellow().bold(),
                    jail
                );
            }
            for (jail, err) in &report.failed {
                println!("{} {}: {}", "Failed jail".red().bold(), jail, err);
            }
            Ok(())
        }
        other => anyhow::bail!("Unexpected response: {:?}", other),
    }
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();

    match output {
        Some(path) => {
            config.save(&path)?;
            println!("Configuration written to {:?}", path);
        }
        None => {
            let content = toml::to_string_pretty(&config)?;
            println!("{}", content);
        }
    }

    Ok(())
}

fn cmd_test_filter(config: Config, filter: String, logfile: PathBuf) -> Result<()> {
    let pattern_set = config
        .filter(&filter)
        .with_context(|| format!("Unknown filter '{}'", filter))?;
    let matcher = PatternMatcher::compile("test-filter", &filter, &pattern_set)?;

    let summary = scan_log(&matcher, &logfile)?;

    println!(
        "Lines: {}  Failures: {}  Ignored: {}  Unmatched: {}",
        summary.lines,
        summary.failures.to_string().red().bold(),
        summary.ignored,
        summary.lines - summary.failures - summary.ignored
    );

    if !summary.by_rule.is_empty() {
        println!("\n{}", "Per rule".bold());
        println!("{}", Table::new(count_rows(&summary.by_rule)));
    }
    if !summary.by_address.is_empty() {
        println!("\n{}", "Per address".bold());
        println!("{}", Table::new(count_rows(&summary.by_address)));
    }

    Ok(())
}

#[derive(Debug, Default)]
struct FilterSummary {
    lines: usize,
    failures: usize,
    ignored: usize,
    by_rule: BTreeMap<String, usize>,
    by_address: BTreeMap<String, usize>,
}

fn scan_log(matcher: &PatternMatcher, path: &Path) -> Result<FilterSummary> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let now = Utc::now();
    let mut summary = FilterSummary::default();

    for line in std::io::BufReader::new(file).split(b'\n') {
        let line = line?;
        let text = String::from_utf8_lossy(&line);
        let record = LogRecord::new("test-filter", text.trim_end_matches('\r')).observed(now);
        summary.lines += 1;

        let Some(event) = matcher.match_record(&record) else {
            continue;
        };
        match event.kind {
            MatchKind::Ignore => summary.ignored += 1,
            MatchKind::Failure => {
                summary.failures += 1;
                *summary.by_rule.entry(event.rule_id).or_default() += 1;
                if let Some(ip) = event.address {
                    *summary.by_address.entry(ip.to_string()).or_default() += 1;
                }
            }
        }
    }

    Ok(summary)
}

fn count_rows(counts: &BTreeMap<String, usize>) -> Vec<CountRow> {
    let mut rows: Vec<CountRow> = counts
        .iter()
        .map(|(key, hits)| CountRow {
            key: key.clone(),
            hits: *hits,
        })
        .collect();
    rows.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.key.cmp(&b.key)));
    rows
}

fn expiry_text(ban: &BanRecord) -> String {
    match ban.remaining_secs(Utc::now()) {
        Some(secs) => format!("{}s", secs),
        None => "permanent".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_scan_log_counts_rules_and_addresses() {
        let config = Config::default();
        let sshd = config.filter("sshd").unwrap();
        let matcher = PatternMatcher::compile("test-filter", "sshd", &sshd).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "Jan 10 12:00:01 host sshd[1]: Failed password for root from 203.0.113.7 port 22 ssh2"
        )
        .unwrap();
        writeln!(
            file,
            "Jan 10 12:00:02 host sshd[1]: Failed password for root from 203.0.113.7 port 22 ssh2"
        )
        .unwrap();
        writeln!(
            file,
            "Jan 10 12:00:03 host sshd[1]: Invalid user admin from 198.51.100.4 port 4242"
        )
        .unwrap();
        writeln!(file, "Jan 10 12:00:04 host sshd[1]: Accepted publickey for ops").unwrap();

        let summary = scan_log(&matcher, file.path()).unwrap();
        assert_eq!(summary.lines, 4);
        assert_eq!(summary.failures, 3);
        assert_eq!(summary.by_address["203.0.113.7"], 2);
        assert_eq!(summary.by_address["198.51.100.4"], 1);

        let rows = count_rows(&summary.by_address);
        assert_eq!(rows[0].key, "203.0.113.7");
    }

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::try_parse_from(["banwarden", "unban", "2001:db8::1", "--forget"]).unwrap();
        match cli.command {
            Commands::Unban { ip, jail, forget } => {
                assert_eq!(ip, "2001:db8::1".parse::<IpAddr>().unwrap());
                assert_eq!(jail, None);
                assert!(forget);
            }
            _ => panic!("expected unban"),
        }

        let cli = Cli::try_parse_from(["banwarden", "list", "--format", "json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::List {
                format: ListFormat::Json,
                ..
            }
        ));

        assert!(Cli::try_parse_from(["banwarden", "ban", "203.0.113.7"]).is_err());
    }
}
