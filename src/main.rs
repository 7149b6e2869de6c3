pub mod models {
    pub mod reading;
}

pub mod config;
pub mod db {
    #[cfg(test)]
    pub mod memory;
    pub mod models;
    pub mod postgres;
    pub mod store;
}
pub mod quality {
    pub mod classify;
    pub mod thresholds;
}
pub mod schema;
pub mod utils;
pub mod services {
    pub mod dashboard;
    pub mod fake_data;
    pub mod ingest;
    pub mod registry;
    pub mod retention;
}

use crate::config::Config;
use crate::db::models::DeviceChanges;
use crate::db::postgres::PgStore;
use crate::quality::classify;
use crate::services::registry::{Caller, DeviceRegistration};
use crate::services::{dashboard, fake_data, ingest, registry, retention};
use chrono::{NaiveDate, NaiveTime, Utc};
use log::{error, info};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Ingest,
    Latest { api_key: String },
    Scores { api_key: Option<String> },
    Daily { api_key: String },
    Devices { page: i64 },
    RegisterDevice(DeviceRegistration),
    UpdateDevice { api_key: String, changes: DeviceChanges },
    Device { api_key: String },
    DeleteDevice { api_key: String },
    Prune { before: Option<NaiveDate> },
    FakeData,
}

/// `classify` is a pure lookup; everything else runs against the database.
#[derive(Debug, Clone, PartialEq)]
enum Action {
    Classify { metric: String, value: f64 },
    Run(Command),
}

#[derive(Debug, PartialEq)]
struct Cli {
    env_file: Option<PathBuf>,
    action: Action,
}

const USAGE: &str = "usage: airq-ledger [--env-file PATH] <command> [args]
commands:
  ingest                                  read NDJSON readings from stdin
  latest <api_key>
  scores [<api_key>]
  daily <api_key>
  devices [--page N]
  device <api_key>
  register-device --name N --location L [--interval SECS]
  update-device <api_key> [--name N] [--location L] [--interval SECS] [--status online|offline]
  delete-device <api_key>
  prune [--before YYYY-MM-DD]
  fake-data
  classify <metric> <value>               e.g. classify PM2.5 31.5 (no database needed)";

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| format!("serialize output failed: {}", e))?;
    println!("{}", text);
    Ok(())
}

fn run(command: Command) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (pool_size={}, ingest_timeout={}ms, retention_days={}, operator_user_id={})",
        cfg.pool_size.get(),
        cfg.ingest_timeout.as_millis(),
        cfg.reading_retention_days
            .map(|v| v.get().to_string())
            .unwrap_or_else(|| "-".to_string()),
        cfg.operator_user_id
    );

    // 2) Connect DB
    let store = PgStore::connect(&cfg.database_url, cfg.pool_size, cfg.ingest_timeout)?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    let applied = store.apply_migrations()?;
    if applied.is_empty() {
        info!("Database schema is up to date; no migrations were applied");
    } else {
        info!("Applied {} database migration(s): {}", applied.len(), applied.join(", "));
    }

    // 4) Dispatch
    let operator = Caller::operator(cfg.operator_user_id);
    match command {
        Command::Ingest => {
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            let summary = ingest::ingest_ndjson(&store, stdin.lock(), stdout.lock())?;
            info!(
                "Ingest finished (accepted={}, rejected={}, invalid={}, failed={})",
                summary.accepted, summary.rejected, summary.invalid, summary.failed
            );
            if summary.failed > 0 {
                return Err(format!("{} reading(s) could not be stored", summary.failed));
            }
            Ok(())
        }
        Command::Latest { api_key } => {
            let reading = dashboard::get_latest_reading(&store, &api_key).map_err(|e| e.to_string())?;
            print_json(&reading)
        }
        Command::Scores { api_key: Some(api_key) } => {
            let score = dashboard::get_latest_classification(&store, &api_key).map_err(|e| e.to_string())?;
            print_json(&score)
        }
        Command::Scores { api_key: None } => {
            let scores = dashboard::list_scores(&store).map_err(|e| e.to_string())?;
            print_json(&scores)
        }
        Command::Daily { api_key } => {
            let rows = dashboard::get_daily_aggregates(&store, &api_key).map_err(|e| e.to_string())?;
            print_json(&rows)
        }
        Command::Devices { page } => {
            let page = registry::list_devices(&store, page).map_err(|e| e.to_string())?;
            print_json(&page)
        }
        Command::Device { api_key } => {
            let device = registry::get_device(&store, &api_key).map_err(|e| e.to_string())?;
            print_json(&device)
        }
        Command::RegisterDevice(registration) => {
            let device = registry::register_device(&store, &operator, &registration).map_err(|e| e.to_string())?;
            print_json(&device)
        }
        Command::UpdateDevice { api_key, changes } => {
            let device =
                registry::update_device(&store, &operator, &api_key, &changes).map_err(|e| e.to_string())?;
            print_json(&device)
        }
        Command::DeleteDevice { api_key } => {
            let counts = registry::delete_device(&store, &operator, &api_key).map_err(|e| e.to_string())?;
            print_json(&counts)
        }
        Command::Prune { before } => {
            let cutoff = match (before, cfg.reading_retention_days) {
                (Some(day), _) => day.and_time(NaiveTime::MIN).and_utc(),
                (None, Some(days)) => retention::cutoff_from_days(Utc::now().date_naive(), days.get()),
                (None, None) => {
                    return Err("prune needs --before YYYY-MM-DD or READING_RETENTION_DAYS".to_string());
                }
            };
            let removed = retention::prune_readings(&store, cutoff).map_err(|e| e.to_string())?;
            print_json(&serde_json::json!({ "removed": removed, "cutoff": cutoff }))
        }
        Command::FakeData => {
            let summary = fake_data::run(&store, &operator, cfg.fake_data_days, Utc::now())?;
            print_json(&summary)
        }
    }
}

/// Split `--flag=value` into its parts; `--flag` alone yields no value.
fn split_flag(arg: &str) -> (&str, Option<&str>) {
    match arg.split_once('=') {
        Some((flag, value)) if flag.starts_with("--") => (flag, Some(value)),
        _ => (arg, None),
    }
}

fn flag_value<I: Iterator<Item = String>>(flag: &str, inline: Option<&str>, rest: &mut I) -> Result<String, String> {
    let value = match inline {
        Some(v) => v.to_string(),
        None => rest
            .next()
            .ok_or_else(|| format!("`{}` requires a value", flag))?,
    };
    if value.is_empty() {
        return Err(format!("`{}` requires a value", flag));
    }
    Ok(value)
}

fn parse_number<T: std::str::FromStr>(flag: &str, raw: &str) -> Result<T, String> {
    raw.parse::<T>()
        .map_err(|_| format!("`{}` expects a number, got {}", flag, raw))
}

fn positional<I: Iterator<Item = String>>(command: &str, what: &str, rest: &mut I) -> Result<String, String> {
    match rest.next() {
        Some(v) if !v.starts_with("--") => Ok(v),
        _ => Err(format!("`{}` requires <{}>", command, what)),
    }
}

fn parse_command<I: Iterator<Item = String>>(name: &str, mut rest: I) -> Result<Action, String> {
    let action = match name {
        "classify" => {
            let metric = positional(name, "metric", &mut rest)?;
            let raw = rest.next().ok_or("`classify` requires <value>")?;
            Action::Classify {
                value: parse_number("value", &raw)?,
                metric,
            }
        }
        _ => Action::Run(match name {
            "ingest" => Command::Ingest,
            "fake-data" => Command::FakeData,
            "latest" => Command::Latest {
                api_key: positional(name, "api_key", &mut rest)?,
            },
            "daily" => Command::Daily {
                api_key: positional(name, "api_key", &mut rest)?,
            },
            "device" => Command::Device {
                api_key: positional(name, "api_key", &mut rest)?,
            },
            "delete-device" => Command::DeleteDevice {
                api_key: positional(name, "api_key", &mut rest)?,
            },
            "scores" => Command::Scores { api_key: rest.next() },
            "devices" => {
                let mut page = 1;
                while let Some(arg) = rest.next() {
                    match split_flag(&arg) {
                        ("--page", inline) => page = parse_number("--page", &flag_value("--page", inline, &mut rest)?)?,
                        (other, _) => return Err(format!("unrecognised argument for devices: {}", other)),
                    }
                }
                Command::Devices { page }
            }
            "register-device" => {
                let (mut name_arg, mut location, mut interval) = (None, None, None);
                while let Some(arg) = rest.next() {
                    match split_flag(&arg) {
                        ("--name", inline) => name_arg = Some(flag_value("--name", inline, &mut rest)?),
                        ("--location", inline) => location = Some(flag_value("--location", inline, &mut rest)?),
                        ("--interval", inline) => {
                            interval = Some(parse_number("--interval", &flag_value("--interval", inline, &mut rest)?)?)
                        }
                        (other, _) => return Err(format!("unrecognised argument for register-device: {}", other)),
                    }
                }
                Command::RegisterDevice(DeviceRegistration {
                    name: name_arg.ok_or("`register-device` requires --name")?,
                    location: location.ok_or("`register-device` requires --location")?,
                    sampling_interval_secs: interval,
                })
            }
            "update-device" => {
                let api_key = positional(name, "api_key", &mut rest)?;
                let mut changes = DeviceChanges::default();
                while let Some(arg) = rest.next() {
                    match split_flag(&arg) {
                        ("--name", inline) => changes.name = Some(flag_value("--name", inline, &mut rest)?),
                        ("--location", inline) => changes.location = Some(flag_value("--location", inline, &mut rest)?),
                        ("--status", inline) => changes.status = Some(flag_value("--status", inline, &mut rest)?),
                        ("--interval", inline) => {
                            changes.sampling_interval_secs =
                                Some(parse_number("--interval", &flag_value("--interval", inline, &mut rest)?)?)
                        }
                        (other, _) => return Err(format!("unrecognised argument for update-device: {}", other)),
                    }
                }
                if changes.is_empty() {
                    return Err("`update-device` needs at least one of --name, --location, --interval, --status".into());
                }
                Command::UpdateDevice { api_key, changes }
            }
            "prune" => {
                let mut before = None;
                while let Some(arg) = rest.next() {
                    match split_flag(&arg) {
                        ("--before", inline) => {
                            let raw = flag_value("--before", inline, &mut rest)?;
                            before = Some(
                                NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                                    .map_err(|_| "--before must be in YYYY-MM-DD format".to_string())?,
                            );
                        }
                        (other, _) => return Err(format!("unrecognised argument for prune: {}", other)),
                    }
                }
                Command::Prune { before }
            }
            other => return Err(format!("unknown command: {}\n{}", other, USAGE)),
        }),
    };

    if let Some(extra) = rest.next() {
        return Err(format!("unexpected argument for {}: {}", name, extra));
    }
    Ok(action)
}

fn parse_cli<I: IntoIterator<Item = String>>(args: I) -> Result<Cli, String> {
    let mut args = args.into_iter();
    let mut env_file: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        match split_flag(&arg) {
            ("--env-file", inline) => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let value = inline
                    .map(str::to_string)
                    .or_else(|| args.next())
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
                env_file = Some(PathBuf::from(value));
            }
            ("--help", None) | ("-h", None) => return Err(USAGE.to_string()),
            (other, _) if other.starts_with('-') => return Err(format!("unrecognised argument: {}", other)),
            (name, _) => {
                let action = parse_command(name, args)?;
                return Ok(Cli { env_file, action });
            }
        }
    }
    Err(format!("missing command\n{}", USAGE))
}

fn configure_env(env_file: Option<PathBuf>) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        load_env_file(&path)?;
        Ok(Some(LoadedEnvFile { path, explicit: true }))
    } else {
        let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
        let default_path = cwd.join(".env");
        if default_path.is_file() {
            load_env_file(&default_path)?;
            Ok(Some(LoadedEnvFile {
                path: default_path,
                explicit: false,
            }))
        } else {
            Ok(None)
        }
    }
}

fn load_env_file(path: &Path) -> Result<(), String> {
    use std::fs::File;
    use std::io::{BufRead, BufReader};

    let file = File::open(path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
    let reader = BufReader::new(file);

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| format!("failed to read {} at line {}: {}", path.display(), index + 1, e))?;
        match parse_env_assignment(&line) {
            Ok(Some((key, value))) => {
                // The process environment takes precedence over the file.
                if std::env::var_os(&key).is_none() {
                    // Mutating the environment is unsafe once threads exist; this runs before any are spawned.
                    unsafe {
                        std::env::set_var(key, value);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => return Err(format!("{}:{}: {}", path.display(), index + 1, e)),
        }
    }

    Ok(())
}

fn parse_env_assignment(line: &str) -> Result<Option<(String, String)>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let assignment = trimmed
        .strip_prefix("export ")
        .map(str::trim_start)
        .unwrap_or(trimmed);
    let (key, raw_value) = assignment
        .split_once('=')
        .ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();

    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    Ok(Some((key.to_string(), parse_env_value(raw_value)?)))
}

fn parse_env_value(raw: &str) -> Result<String, String> {
    let value = raw.trim();
    if let Some(rest) = value.strip_prefix('"') {
        parse_quoted(rest, '"', true)
    } else if let Some(rest) = value.strip_prefix('\'') {
        parse_quoted(rest, '\'', false)
    } else {
        Ok(value.split('#').next().unwrap_or_default().trim_end().to_string())
    }
}

/// Read up to the closing `quote`; only trailing whitespace or a comment may follow.
fn parse_quoted(input: &str, quote: char, escapes: bool) -> Result<String, String> {
    let mut result = String::new();
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        if escapes && ch == '\\' {
            let escaped = chars
                .next()
                .ok_or_else(|| "unterminated escape sequence in quoted value".to_string())?;
            result.push(match escaped {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
        } else if ch == quote {
            let remainder = chars.as_str().trim();
            return if remainder.is_empty() || remainder.starts_with('#') {
                Ok(result)
            } else {
                Err("unexpected characters after closing quote".to_string())
            };
        } else {
            result.push(ch);
        }
    }

    Err("unterminated quoted value".to_string())
}

fn main() {
    let args: Result<Vec<String>, String> = std::env::args_os()
        .skip(1)
        .map(|a| a.into_string().map_err(|_| "argument contains invalid UTF-8".to_string()))
        .collect();
    let cli = match args.and_then(parse_cli) {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };
    let loaded_env = match configure_env(cli.env_file) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "airq-ledger {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    let result = match cli.action {
        Action::Classify { metric, value } => print_json(&classify::classify_named(&metric, value)),
        Action::Run(command) => run(command),
    };
    if let Err(e) = result {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
