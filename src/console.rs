//! Line console on stdin. Lets an operator read and write the state tree the
//! way the supervising system would; writes go in unacknowledged and are
//! therefore sent to the device.

use crate::mqtt::mqtt_handler::LinkStatus;
use crate::store::memory::MemoryStore;
use crate::store::{ObjectStore, StateValue};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Get(String),
    Set(String, StateValue),
    /// Object ids, optionally filtered by prefix
    Objects(Option<String>),
    Status,
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let mut parts = line.trim().splitn(3, char::is_whitespace);
    let verb = parts.next().unwrap_or_default();
    let id = parts.next().map(str::to_string);
    let rest = parts.next().map(str::trim);

    match (verb, id, rest) {
        ("get", Some(id), None) => Ok(ConsoleCommand::Get(id)),
        ("set", Some(id), Some(value)) if !value.is_empty() => {
            Ok(ConsoleCommand::Set(id, parse_value(value)))
        }
        ("objects" | "ls", prefix, None) => Ok(ConsoleCommand::Objects(prefix)),
        ("status", None, None) => Ok(ConsoleCommand::Status),
        ("help" | "?", None, None) => Ok(ConsoleCommand::Help),
        ("quit" | "exit", None, None) => Ok(ConsoleCommand::Quit),
        ("", None, None) => Err(String::new()),
        _ => Err(format!("Cannot parse \"{}\", try help", line.trim())),
    }
}

/// `true`/`false`, numbers, anything else as a string. Quotes force a string.
fn parse_value(raw: &str) -> StateValue {
    if let Some(quoted) = raw
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        return StateValue::from(quoted);
    }
    match raw {
        "true" => StateValue::Bool(true),
        "false" => StateValue::Bool(false),
        _ => match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => StateValue::Number(n),
            _ => StateValue::from(raw),
        },
    }
}

const HELP: &str = "\
get <id>            show a state
set <id> <value>    write a state (unacknowledged)
objects [prefix]    list object ids
status              broker link status
quit                stop the bridge";

/// Reads commands until `quit`, end of input or cancellation. `quit` cancels
/// the whole bridge.
pub async fn run(
    store: Arc<MemoryStore>,
    status: watch::Receiver<LinkStatus>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("sonoff-bridge console, type help for commands");

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Console input closed");
                break;
            }
            Err(e) => {
                warn!("Cannot read console input: {}", e);
                break;
            }
        };

        match parse_command(&line) {
            Ok(ConsoleCommand::Quit) => {
                cancel.cancel();
                break;
            }
            Ok(command) => println!("{}", execute(store.as_ref(), &status, command).await),
            Err(message) if message.is_empty() => {}
            Err(message) => println!("{}", message),
        }
    }
}

async fn execute(
    store: &MemoryStore,
    status: &watch::Receiver<LinkStatus>,
    command: ConsoleCommand,
) -> String {
    match command {
        ConsoleCommand::Get(id) => match store.get_state(&id).await {
            Ok(Some(state)) => format!(
                "{} = {} (ack={}, {})",
                id,
                state.val,
                state.ack,
                state.ts.format("%H:%M:%S")
            ),
            Ok(None) => format!("{} has no state", id),
            Err(e) => e.to_string(),
        },
        ConsoleCommand::Set(id, value) => match store.set_state(&id, value, false).await {
            Ok(()) => "ok".to_string(),
            Err(e) => e.to_string(),
        },
        ConsoleCommand::Objects(prefix) => {
            let ids: Vec<String> = store
                .object_ids()
                .await
                .into_iter()
                .filter(|id| prefix.as_deref().map_or(true, |p| id.starts_with(p)))
                .collect();
            if ids.is_empty() {
                "no objects".to_string()
            } else {
                ids.join("\n")
            }
        }
        ConsoleCommand::Status => {
            let status = status.borrow();
            let mut out = format!(
                "{:?}, received {}, sent {}",
                status.connection_state, status.messages_received, status.messages_sent
            );
            if let Some(last) = status.last_activity {
                out.push_str(&format!(", last activity {}", last.format("%H:%M:%S")));
            }
            for error in &status.error_messages {
                out.push_str(&format!("\n  {}", error));
            }
            out
        }
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => String::new(),
    }
}
