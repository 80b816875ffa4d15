pub mod models {
    pub mod hilo;
}

pub mod client;
pub mod config;
pub mod device;
pub mod hass;
pub mod hilo;
pub mod host;
pub mod http;
pub mod registry;
pub mod tariff;
pub mod utils;

#[cfg(test)]
mod testing;

use crate::client::{Credentials, HiloClient};
use crate::config::Config;
use crate::hass::HassRest;
use crate::hilo::Hilo;
use crate::http::UreqTransport;
use crate::models::hilo::DeviceId;
use crate::tariff::TariffEngine;
use crate::utils::{Clock, SystemClock};
use log::{error, info, warn};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Default, PartialEq)]
enum Command {
    /// Poll forever.
    #[default]
    Run,
    /// Write one attribute to one device and exit.
    Set {
        device: String,
        attribute: String,
        value: String,
    },
}

#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    env_file: Option<PathBuf>,
    command: Command,
}

fn build_bridge(cfg: &Config) -> Hilo {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let credentials = Credentials {
        username: cfg.hilo_username.clone(),
        password: cfg.hilo_password.clone(),
    };
    let client = HiloClient::new(credentials, Box::new(UreqTransport::new()), clock.clone())
        .with_retry_policy(cfg.request_timeout, cfg.max_request_retries);
    let hass = HassRest::new(
        &cfg.hass_url,
        &cfg.hass_token,
        Rc::new(UreqTransport::new()),
        cfg.request_timeout,
    );
    let tariff = TariffEngine::new(cfg.tariff.clone(), clock.clone());

    Hilo::new(
        client,
        tariff,
        Box::new(hass.clone()),
        Box::new(hass),
        clock,
        cfg.scan_interval,
    )
    .with_event_tracking(cfg.track_events)
}

fn run(command: Command) -> Result<(), String> {
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (hass_url={}, scan_interval={}s, plan={}, high_periods={}, max_request_retries={}, request_timeout={}s, track_events={})",
        cfg.hass_url,
        cfg.scan_interval.as_secs(),
        cfg.tariff.plan_name,
        cfg.tariff
            .high_periods
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(","),
        cfg.max_request_retries,
        cfg.request_timeout.as_secs(),
        cfg.track_events
    );

    let mut hilo = build_bridge(&cfg);
    match command {
        Command::Run => poll_loop(&mut hilo, cfg.scan_interval),
        Command::Set {
            device,
            attribute,
            value,
        } => set_once(&mut hilo, &device, &attribute, &value),
    }
}

fn poll_loop(hilo: &mut Hilo, interval: Duration) -> Result<(), String> {
    info!("Starting poll loop: interval={}s", interval.as_secs());
    loop {
        let tick_start = Instant::now();

        match hilo.poll_cycle() {
            Ok(true) => {}
            // Wall clock lagged the sleep; try again shortly.
            Ok(false) => {
                thread::sleep(Duration::from_secs(1));
                continue;
            }
            Err(e) if e.is_fatal() || hilo.is_disabled() => return Err(format!("Hilo integration stopped: {}", e)),
            Err(e) => warn!("Poll cycle failed: {}", e),
        }

        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}

/// JSON literals (`21.5`, `true`) are sent as such; anything else as a string.
fn parse_attribute_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn set_once(hilo: &mut Hilo, device: &str, attribute: &str, value: &str) -> Result<(), String> {
    hilo.poll_cycle().map_err(|e| format!("Device discovery failed: {}", e))?;
    let id = DeviceId::from(device);
    if hilo.registry().is_empty() {
        return Err("No devices were discovered on this account".to_string());
    }
    if hilo.device(&id).is_none() {
        let known = hilo
            .registry()
            .iter()
            .map(|d| format!("{} ({})", d.id(), d.name()))
            .collect::<Vec<_>>();
        return Err(format!("Unknown device {}; known devices: {}", id, known.join(", ")));
    }
    hilo.set_attribute(&id, attribute, parse_attribute_value(value))
        .map_err(|e| format!("Setting {} on {} failed: {}", attribute, id, e))?;
    info!("Set {} = {} on device {}", attribute, value, id);
    Ok(())
}

/// Where the environment file came from, for the startup log.
#[derive(Debug)]
struct EnvSource {
    path: PathBuf,
    explicit: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs, String> {
    let mut args = args.into_iter();
    let mut cli = CliArgs::default();
    let mut positional = Vec::new();
    while let Some(arg) = args.next() {
        let path = if arg == "--env-file" {
            args.next()
                .ok_or_else(|| "`--env-file` requires a path argument".to_string())?
        } else if let Some(rest) = arg.strip_prefix("--env-file=") {
            rest.to_string()
        } else if arg.starts_with("--") {
            return Err(format!("unrecognised argument: {}", arg));
        } else {
            positional.push(arg);
            continue;
        };
        if path.is_empty() {
            return Err("`--env-file` requires a path argument".to_string());
        }
        if cli.env_file.replace(PathBuf::from(path)).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }

    cli.command = match positional.as_slice() {
        [] => Command::Run,
        [cmd] if cmd == "run" => Command::Run,
        [cmd, device, attribute, value] if cmd == "set" => Command::Set {
            device: device.clone(),
            attribute: attribute.clone(),
            value: value.clone(),
        },
        [cmd, ..] if cmd == "set" => return Err("usage: set <device-id> <attribute> <value>".to_string()),
        [other, ..] => return Err(format!("unrecognised command: {}", other)),
    };
    Ok(cli)
}

fn load_environment(explicit: Option<PathBuf>) -> Result<Option<EnvSource>, String> {
    let source = match explicit {
        Some(path) if path.is_file() => EnvSource { path, explicit: true },
        Some(path) => return Err(format!("env file not found: {}", path.display())),
        None => {
            let path = Path::new(".env").to_path_buf();
            if !path.is_file() {
                return Ok(None);
            }
            EnvSource { path, explicit: false }
        }
    };

    let contents = std::fs::read_to_string(&source.path)
        .map_err(|e| format!("failed to read {}: {}", source.path.display(), e))?;
    for (key, value) in parse_env_file(&contents).map_err(|e| format!("{}:{}", source.path.display(), e))? {
        // Values already present in the process environment win.
        if std::env::var_os(&key).is_none() {
            // Mutating the environment is unsafe once other threads exist; none do yet.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(Some(source))
}

/// `KEY=value` lines; blank lines, `#` comments and an `export ` prefix are allowed.
/// Single-quoted values are literal; double-quoted ones understand `\n`, `\r`,
/// `\t`, `\\` and `\"`.
fn parse_env_file(contents: &str) -> Result<Vec<(String, String)>, String> {
    let mut pairs = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
        let (key, raw) = line
            .split_once('=')
            .ok_or_else(|| format!("{}: missing '=' in assignment", index + 1))?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(format!("{}: invalid variable name `{}`", index + 1, key));
        }
        pairs.push((key.to_string(), unquote(raw.trim()).map_err(|e| format!("{}: {}", index + 1, e))?));
    }
    Ok(pairs)
}

fn unquote(raw: &str) -> Result<String, String> {
    let (value, tail) = if let Some(rest) = raw.strip_prefix('"') {
        read_double_quoted(rest)?
    } else if let Some(rest) = raw.strip_prefix('\'') {
        rest.split_once('\'')
            .map(|(inner, tail)| (inner.to_string(), tail))
            .ok_or_else(|| "unterminated single-quoted value".to_string())?
    } else {
        let value = raw.split_once(" #").map(|(v, _)| v).unwrap_or(raw);
        return Ok(value.trim_end().to_string());
    };
    let tail = tail.trim();
    if !tail.is_empty() && !tail.starts_with('#') {
        return Err("unexpected characters after closing quote".to_string());
    }
    Ok(value)
}

/// Returns the unescaped value and whatever follows the closing quote.
fn read_double_quoted(input: &str) -> Result<(String, &str), String> {
    let mut value = String::new();
    let mut chars = input.char_indices();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '"' => return Ok((value, &input[i + 1..])),
            '\\' => {
                let (_, escaped) = chars
                    .next()
                    .ok_or_else(|| "unterminated escape sequence in double-quoted value".to_string())?;
                value.push(match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
            }
            other => value.push(other),
        }
    }
    Err("unterminated double-quoted value".to_string())
}

fn main() {
    let startup = std::env::args_os()
        .skip(1)
        .map(|a| a.into_string().map_err(|_| "argument contains invalid UTF-8".to_string()))
        .collect::<Result<Vec<_>, _>>()
        .and_then(parse_args)
        .and_then(|cli| Ok((load_environment(cli.env_file)?, cli.command)));
    let (env_source, command) = match startup {
        Ok(parts) => parts,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // After the env file, so RUST_LOG from it applies.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(source) = env_source.as_ref() {
        let origin = if source.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} env file: {}", origin, source.path.display());
    }

    info!(
        "hilo-bridge {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(command) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
