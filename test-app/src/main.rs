// avlink test application -- CLI tool for exercising a device model against
// real hardware on a serial port or behind a TCP serial gateway.
//
// Usage:
//   avlink-test-app --model mx160.yaml describe
//   avlink-test-app --model mx160.yaml describe --json
//   avlink-test-app --model mx160.yaml --url /dev/ttyUSB0 send power.on zone=1
//   avlink-test-app --model mx160.yaml --url socket://10.0.0.40/ send volume.set zone=1 level=40
//   avlink-test-app --model mx160.yaml --url 10.0.0.40 raw 'PWR?\r'
//   avlink-test-app --model mx160.yaml --url 10.0.0.40 monitor --duration 60
//   avlink-test-app --model mx160.yaml --url 10.0.0.40 stress --count 50 power.on zone=1
//
// Logging goes to stderr and is controlled with RUST_LOG, e.g.
// RUST_LOG=avlink_link=trace to see every byte on the wire.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use avlink::{
    ActionResponse, ArgValue, Args, CommandClient, CommandClientBuilder, DeviceModel, Error,
    LinkEvent, ModelDefinition,
};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// avlink test application -- drives device models from the command line.
#[derive(Parser)]
#[command(name = "avlink-test-app", version, about)]
struct Cli {
    /// Device model definition (YAML or JSON).
    #[arg(long)]
    model: PathBuf,

    /// Device address: serial path (/dev/ttyUSB0, COM3), host[:port], or
    /// socket://host[:port]/. Required for everything except `describe`.
    #[arg(long)]
    url: Option<String>,

    /// Override the model's baud rate.
    #[arg(long)]
    baud: Option<u32>,

    /// Override the model's response timeout, in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Override the model's minimum time between commands, in milliseconds.
    #[arg(long)]
    interval_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the model's actions with their parameters and response fields.
    Describe {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Send one action, e.g. `send volume.set zone=1 level=40`.
    Send {
        action: String,
        /// Arguments as name=value; integers are passed as numbers.
        args: Vec<String>,
    },

    /// Write raw bytes without waiting for a reply. Accepts \r, \n, \t,
    /// \\ and \xHH escapes.
    Raw { data: String },

    /// Print every line the device sends.
    Monitor {
        /// Duration in seconds (0 = run until the link closes).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },

    /// Send the same action repeatedly and report timing.
    Stress {
        /// Number of commands to send.
        #[arg(long, default_value_t = 100)]
        count: u32,
        action: String,
        args: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse `name=value` pairs; values that parse as integers become
/// [`ArgValue::Int`].
fn parse_args(pairs: &[String]) -> Result<Args> {
    let mut args = Args::new();
    for pair in pairs {
        let Some((name, value)) = pair.split_once('=') else {
            bail!("argument {pair:?} is not name=value");
        };
        if name.is_empty() {
            bail!("argument {pair:?} has an empty name");
        }
        match value.parse::<i64>() {
            Ok(n) => args.insert(name, ArgValue::Int(n)),
            Err(_) => args.insert(name, value),
        }
    }
    Ok(args)
}

/// Expand backslash escapes into raw bytes.
fn parse_escaped(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('r') => out.push(b'\r'),
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('\\') => out.push(b'\\'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                let byte = u8::from_str_radix(&hex, 16)
                    .with_context(|| format!("bad \\x escape {hex:?}"))?;
                out.push(byte);
            }
            Some(other) => bail!("unknown escape \\{other}"),
            None => bail!("trailing backslash"),
        }
    }
    Ok(out)
}

fn load_model(path: &Path) -> Result<Arc<DeviceModel>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    // JSON is a subset of YAML, so one parser covers both.
    let definition: ModelDefinition = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Arc::new(DeviceModel::from_definition(definition)?))
}

async fn create_client(cli: &Cli, model: Arc<DeviceModel>) -> Result<CommandClient> {
    let url = cli
        .url
        .as_deref()
        .context("--url is required for this command")?;

    let mut builder = CommandClientBuilder::new(model).url(url);
    if let Some(baud) = cli.baud {
        builder = builder.baud_rate(baud);
    }
    if let Some(ms) = cli.timeout_ms {
        builder = builder.response_timeout(Duration::from_millis(ms));
    }
    if let Some(ms) = cli.interval_ms {
        builder = builder.min_command_interval(Duration::from_millis(ms));
    }

    println!("Connecting to {url}...");
    let client = builder.connect().await?;
    println!("Connected.\n");
    Ok(client)
}

fn print_response(action: &str, response: &ActionResponse) {
    match response {
        ActionResponse::Fields(m) => {
            println!("{action} -> matched {}", m.action_id);
            for (name, value) in &m.fields {
                println!("  {name:<16} {value}");
            }
        }
        ActionResponse::Text(text) => println!("{action} -> {text:?}"),
        ActionResponse::Sent => println!("{action} -> sent"),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_describe(model: &DeviceModel, json: bool) -> Result<()> {
    let docs = model.describe();
    if json {
        println!("{}", serde_json::to_string_pretty(&docs)?);
        return Ok(());
    }

    println!(
        "{} ({}{})",
        model.id(),
        model.manufacturer().unwrap_or("unknown manufacturer"),
        model.name().map(|n| format!(" {n}")).unwrap_or_default()
    );
    println!("{} actions\n", docs.len());

    for doc in &docs {
        println!("{:<24} {:?}", doc.id, doc.command);
        if let Some(description) = &doc.description {
            println!("    {description}");
        }
        for param in &doc.params {
            println!("    param {:<12} {}", param.name, param.doc.as_deref().unwrap_or(""));
        }
        for field in &doc.fields {
            println!("    field {:<12} {}", field.name, field.doc.as_deref().unwrap_or(""));
        }
    }
    Ok(())
}

async fn cmd_send(client: &CommandClient, action: &str, args: &Args) -> Result<()> {
    let response = client.send_action(action, args).await?;
    print_response(action, &response);
    Ok(())
}

async fn cmd_raw(client: &CommandClient, data: &[u8]) -> Result<()> {
    client.send_raw(data).await?;
    println!("Wrote {} bytes.", data.len());
    Ok(())
}

async fn cmd_monitor(client: &CommandClient, duration_secs: u64) -> Result<()> {
    let mut events = client.events();

    println!("Monitoring device lines...");

    let deadline = (duration_secs > 0).then(|| Instant::now() + Duration::from_secs(duration_secs));
    let start = Instant::now();

    loop {
        let timeout = match deadline {
            Some(dl) => {
                let remaining = dl.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    println!("Monitor duration elapsed.");
                    break;
                }
                remaining
            }
            None => Duration::from_secs(3600),
        };

        match tokio::time::timeout(timeout, events.recv()).await {
            Ok(Ok(LinkEvent::Line(line))) => {
                let elapsed = start.elapsed();
                let matched = match &line.matched {
                    Some(m) => format!("{} {:?}", m.action_id, m.fields),
                    None => "(no match)".to_string(),
                };
                println!(
                    "{:>6}.{:03}s {:<24} {}",
                    elapsed.as_secs(),
                    elapsed.subsec_millis(),
                    format!("{:?}", line.text),
                    matched
                );
            }
            Ok(Ok(LinkEvent::Disconnected { reason })) => {
                println!("Disconnected: {reason}");
                break;
            }
            Ok(Ok(event)) => println!("[event] {event:?}"),
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                println!("[warning] missed {n} lines (consumer too slow)");
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                println!("Event channel closed.");
                break;
            }
            Err(_) => {
                if deadline.is_some() {
                    println!("Monitor duration elapsed.");
                }
                break;
            }
        }
    }

    Ok(())
}

async fn cmd_stress(client: &CommandClient, count: u32, action: &str, args: &Args) -> Result<()> {
    println!("Stress test: {count} x {action} {args}");

    let mut success = 0u32;
    let mut timeouts = 0u32;
    let mut failures = 0u32;
    let mut slowest = Duration::ZERO;
    let start = Instant::now();

    for i in 1..=count {
        let sent = Instant::now();
        match client.send_action(action, args).await {
            Ok(_) => {
                success += 1;
                slowest = slowest.max(sent.elapsed());
            }
            Err(e @ Error::ResponseTimeout { .. }) => {
                eprintln!("[{i}/{count}] {e}");
                timeouts += 1;
            }
            Err(e @ (Error::Link(_) | Error::Closed)) => {
                eprintln!("[{i}/{count}] {e}");
                bail!("link lost after {} commands", i - 1);
            }
            Err(e) => {
                eprintln!("[{i}/{count}] {e}");
                failures += 1;
            }
        }
    }

    let elapsed = start.elapsed();
    let rate = if elapsed.as_secs_f64() > 0.0 {
        count as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };

    println!();
    println!("Results:");
    println!("  Total commands: {count}");
    println!("  Successes:      {success}");
    println!("  Timeouts:       {timeouts}");
    println!("  Other failures: {failures}");
    println!("  Slowest reply:  {:.1} ms", slowest.as_secs_f64() * 1000.0);
    println!("  Elapsed:        {:.3} s", elapsed.as_secs_f64());
    println!("  Rate:           {rate:.1} commands/sec");

    if timeouts + failures > 0 {
        bail!("{} out of {count} commands failed", timeouts + failures);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let model = load_model(&cli.model)?;
    tracing::debug!(model = %model.id(), path = %cli.model.display(), "model loaded");

    // `describe` does not need a device.
    if let Command::Describe { json } = &cli.command {
        return cmd_describe(&model, *json);
    }

    let client = create_client(&cli, model).await?;

    let result = match &cli.command {
        Command::Send { action, args } => cmd_send(&client, action, &parse_args(args)?).await,
        Command::Raw { data } => cmd_raw(&client, &parse_escaped(data)?).await,
        Command::Monitor { duration } => cmd_monitor(&client, *duration).await,
        Command::Stress {
            count,
            action,
            args,
        } => cmd_stress(&client, *count, action, &parse_args(args)?).await,
        Command::Describe { json } => cmd_describe(client.model(), *json),
    };

    client.close().await.ok();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_ints_and_text() {
        let args = parse_args(&["zone=2".into(), "source=HDMI1".into()]).unwrap();
        assert_eq!(args.get("zone"), Some(&ArgValue::Int(2)));
        assert_eq!(args.get("source"), Some(&ArgValue::Text("HDMI1".into())));
        assert!(parse_args(&["zone".into()]).is_err());
        assert!(parse_args(&["=2".into()]).is_err());
    }

    #[test]
    fn escapes_expand() {
        assert_eq!(parse_escaped(r"PWR?\r").unwrap(), b"PWR?\r");
        assert_eq!(parse_escaped(r"\x02ON\x03\\").unwrap(), b"\x02ON\x03\\");
        assert!(parse_escaped(r"\q").is_err());
        assert!(parse_escaped(r"\xZZ").is_err());
        assert!(parse_escaped("\\").is_err());
    }
}
