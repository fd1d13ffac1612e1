//! Monitor a device's unsolicited status lines.
//!
//! Loads a device model from YAML, connects to the device, issues one
//! action, and then prints every line the device sends for 60 seconds,
//! along with the action whose response pattern recognized it.
//!
//! # Usage
//!
//! ```sh
//! cargo run -p avlink --example monitor_device -- model.yaml socket://10.0.0.40/ power.on zone=1
//! ```
//!
//! Set `RUST_LOG=avlink_link=trace` to see every byte on the wire.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use avlink::{ActionResponse, ArgValue, Args, CommandClientBuilder, DeviceModel, LinkEvent, ModelDefinition};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut argv = std::env::args().skip(1);
    let model_path = argv.next().context("usage: monitor_device <model.yaml> <url> [action [k=v ...]]")?;
    let url = argv.next().context("missing device url")?;
    let action = argv.next();
    let args: Args = argv
        .filter_map(|kv| {
            let (k, v) = kv.split_once('=')?;
            let value = match v.parse::<i64>() {
                Ok(n) => ArgValue::Int(n),
                Err(_) => ArgValue::from(v),
            };
            Some((k.to_string(), value))
        })
        .collect();

    let yaml = std::fs::read_to_string(&model_path)
        .with_context(|| format!("reading {model_path}"))?;
    let definition: ModelDefinition = serde_yaml::from_str(&yaml)?;
    let model = Arc::new(DeviceModel::from_definition(definition)?);

    println!("Connecting to {} at {}...", model.id(), url);
    let client = CommandClientBuilder::new(model).url(&url).connect().await?;
    let mut events = client.events();

    if let Some(action) = action {
        match client.send_action(&action, &args).await? {
            ActionResponse::Fields(m) => println!("{action} -> {:?}", m.fields),
            ActionResponse::Text(text) => println!("{action} -> {text:?}"),
            ActionResponse::Sent => println!("{action} sent"),
        }
    }

    println!("Monitoring for 60 seconds...\n");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let start = tokio::time::Instant::now();

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(LinkEvent::Line(line))) => {
                let elapsed = start.elapsed();
                let matched = line
                    .matched
                    .map(|m| format!("{} {:?}", m.action_id, m.fields))
                    .unwrap_or_else(|| "(no match)".into());
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
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                eprintln!("event stream error: {e}");
                break;
            }
            Err(_) => break,
        }
    }

    client.close().await?;
    Ok(())
}
