//! CLI channel — stdin/stdout REPL for local testing.
//!
//! Each input line is `intent key=value key="multi word value"`. Entities are
//! given full confidence because no classifier sits in front of the REPL.

use std::sync::LazyLock;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use super::OutgoingMessage;
use crate::task::{Entities, EventSnapshot};

/// User id and channel id the CLI speaks as.
pub const CLI_USER: &str = "local-user";
pub const CLI_CHANNEL: &str = "cli";

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_]*)=(?:"([^"]*)"|(\S+))"#).expect("valid entity regex")
});

/// A parsed REPL line.
#[derive(Debug, Clone, PartialEq)]
pub struct CliCommand {
    pub intent: String,
    pub event: EventSnapshot,
    pub entities: Entities,
}

/// Parse one input line. Returns `None` for blank lines.
pub fn parse_line(line: &str) -> Option<CliCommand> {
    let line = line.trim();
    let (intent, rest) = match line.split_once(char::is_whitespace) {
        Some((intent, rest)) => (intent, rest),
        None => (line, ""),
    };
    if intent.is_empty() {
        return None;
    }

    let mut entities = Entities::new();
    for caps in ENTITY_RE.captures_iter(rest) {
        let name = &caps[1];
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())
            .unwrap_or_default();
        entities = entities.with(name, value, 1.0);
    }

    Some(CliCommand {
        intent: intent.to_string(),
        event: EventSnapshot::new(CLI_USER, CLI_CHANNEL, rest.trim()),
        entities,
    })
}

/// A simple CLI channel that reads from stdin and writes to stdout.
pub struct CliChannel;

impl CliChannel {
    pub fn new() -> Self {
        Self
    }

    /// Start reading stdin. The returned receiver yields parsed commands
    /// until EOF.
    pub fn start(&self) -> mpsc::UnboundedReceiver<CliCommand> {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let reader = BufReader::new(tokio::io::stdin());
            let mut lines = reader.lines();

            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(command) = parse_line(&line) else {
                            eprint!("> ");
                            continue;
                        };
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        rx
    }

    /// Print outgoing messages until the sending side closes.
    pub fn spawn_printer(
        &self,
        mut rx: mpsc::Receiver<OutgoingMessage>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                println!("\n[{}] {}\n", msg.channel, msg.text);
                eprint!("> ");
            }
        })
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}
