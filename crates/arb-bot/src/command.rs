//! Control-plane commands, serialised onto the single-writer loop.
//!
//! Commands arrive over a bounded channel, optionally carrying a reply slot
//! so the operator surface (stdin CLI here; anything speaking the same
//! channel later) can print the ok/refused/error outcome.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Recognised control commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    Flatten,
    Reload,
    Set(Vec<(String, String)>),
    MarketsOn(Vec<String>),
    MarketsOff(Vec<String>),
    Backtest,
    Stop,
}

impl Command {
    /// Parse an operator line: `pause`, `set min_edge_threshold=0.01 ...`,
    /// `markets off m1,m2`, ...
    pub fn parse(line: &str) -> Result<Command, String> {
        let line = line.trim();
        let lower = line.to_lowercase();
        match lower.as_str() {
            "pause" => return Ok(Command::Pause),
            "resume" => return Ok(Command::Resume),
            "flatten" => return Ok(Command::Flatten),
            "reload" => return Ok(Command::Reload),
            "backtest" => return Ok(Command::Backtest),
            "stop" => return Ok(Command::Stop),
            _ => {}
        }
        if let Some(rest) = lower.strip_prefix("markets on ") {
            return Ok(Command::MarketsOn(parse_market_list(rest)));
        }
        if let Some(rest) = lower.strip_prefix("markets off ") {
            return Ok(Command::MarketsOff(parse_market_list(rest)));
        }
        if let Some(rest) = line.strip_prefix("set ") {
            let mut pairs = Vec::new();
            for token in rest.split_whitespace() {
                let Some((key, value)) = token.split_once('=') else {
                    return Err(format!("expected key=value, got '{token}'"));
                };
                pairs.push((key.to_string(), value.to_string()));
            }
            if pairs.is_empty() {
                return Err("set requires at least one key=value pair".to_string());
            }
            return Ok(Command::Set(pairs));
        }
        Err(format!("unknown command: {line}"))
    }
}

fn parse_market_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Outcome reported back to the operator.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CommandOutcome {
    Ok { detail: String },
    Refused { reason: String },
    Error { reason: String },
}

impl CommandOutcome {
    pub fn ok(detail: impl Into<String>) -> Self {
        CommandOutcome::Ok {
            detail: detail.into(),
        }
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        CommandOutcome::Refused {
            reason: reason.into(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        CommandOutcome::Error {
            reason: reason.into(),
        }
    }
}

/// A command plus its reply slot.
#[derive(Debug)]
pub struct CommandEnvelope {
    pub command: Command,
    pub reply: Option<oneshot::Sender<CommandOutcome>>,
}

#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<CommandEnvelope>,
}

impl CommandSender {
    /// Fire-and-forget publish.
    pub async fn publish(&self, command: Command) -> bool {
        self.tx
            .send(CommandEnvelope {
                command,
                reply: None,
            })
            .await
            .is_ok()
    }

    /// Publish and wait for the engine's outcome.
    pub async fn request(&self, command: Command) -> CommandOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(CommandEnvelope {
                command,
                reply: Some(reply_tx),
            })
            .await
            .is_err()
        {
            return CommandOutcome::error("engine is shutting down");
        }
        reply_rx
            .await
            .unwrap_or_else(|_| CommandOutcome::error("engine dropped the command"))
    }
}

pub fn command_channel(capacity: usize) -> (CommandSender, mpsc::Receiver<CommandEnvelope>) {
    let (tx, rx) = mpsc::channel(capacity);
    (CommandSender { tx }, rx)
}

/// Minimal operator surface: read command lines from stdin, print JSON
/// outcomes to stdout. Runs until `stop` or EOF.
pub async fn run_stdin_control(sender: CommandSender) {
    info!(
        component = "control",
        "command api ready: pause|resume|flatten|reload|set k=v ...|markets on/off <ids>|backtest|stop"
    );
    use tokio::io::AsyncBufReadExt;
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin());
    loop {
        let mut line = String::new();
        match lines.read_line(&mut line).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) => {
                warn!(component = "control", error = %err, "stdin read failed");
                return;
            }
        }
        if line.trim().is_empty() {
            continue;
        }
        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(reason) => {
                let outcome = CommandOutcome::error(reason);
                println!("{}", serde_json::to_string(&outcome).unwrap_or_default());
                continue;
            }
        };
        let is_stop = command == Command::Stop;
        let outcome = sender.request(command).await;
        println!("{}", serde_json::to_string(&outcome).unwrap_or_default());
        if is_stop {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(Command::parse("pause").unwrap(), Command::Pause);
        assert_eq!(Command::parse(" RESUME ").unwrap(), Command::Resume);
        assert_eq!(Command::parse("flatten").unwrap(), Command::Flatten);
        assert_eq!(Command::parse("stop").unwrap(), Command::Stop);
    }

    #[test]
    fn test_parse_markets_toggle() {
        assert_eq!(
            Command::parse("markets off m1, m2").unwrap(),
            Command::MarketsOff(vec!["m1".to_string(), "m2".to_string()])
        );
        assert_eq!(
            Command::parse("markets on m3").unwrap(),
            Command::MarketsOn(vec!["m3".to_string()])
        );
    }

    #[test]
    fn test_parse_set_pairs() {
        let cmd = Command::parse("set min_edge_threshold=0.01 failure_buffer=0.002").unwrap();
        assert_eq!(
            cmd,
            Command::Set(vec![
                ("min_edge_threshold".to_string(), "0.01".to_string()),
                ("failure_buffer".to_string(), "0.002".to_string()),
            ])
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Command::parse("dance").is_err());
        assert!(Command::parse("set").is_err());
        assert!(Command::parse("set notapair").is_err());
    }

    #[test]
    fn test_outcome_serialises_with_status_tag() {
        let json = serde_json::to_string(&CommandOutcome::ok("paused")).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        let json = serde_json::to_string(&CommandOutcome::refused("breaker active")).unwrap();
        assert!(json.contains("\"status\":\"refused\""));
    }

    #[tokio::test]
    async fn test_channel_roundtrip() {
        let (sender, mut rx) = command_channel(8);
        let handle = tokio::spawn(async move {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(envelope.command, Command::Pause);
            if let Some(reply) = envelope.reply {
                let _ = reply.send(CommandOutcome::ok("paused"));
            }
        });
        let outcome = sender.request(Command::Pause).await;
        assert_eq!(outcome, CommandOutcome::ok("paused"));
        handle.await.unwrap();
    }
}
