//! Line-based control surface for changing chaos settings while the proxy
//! is running.

use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::state::HavocState;

/// Step applied by `latency +` / `latency -`, in milliseconds
pub const LATENCY_STEP_MS: i64 = 500;
/// Step applied by `jitter +` / `jitter -`, in milliseconds
pub const JITTER_STEP_MS: i64 = 100;
/// Step applied by `drop +` / `drop -`
pub const DROP_RATE_STEP: f64 = 0.05;

const HELP: &str = "\
commands:
  latency <duration|+|->   set or step base latency (step 500ms, max 30s)
  jitter <duration|+|->    set or step jitter (step 100ms, max 10s)
  drop <rate|+|->          set or step drop rate (step 0.05, range 0..1)
  status                   show settings and traffic
  reset                    zero the traffic counters
  help                     show this help
  quit                     stop the proxy";

/// Error type for console input
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CommandError {
    #[error("unknown command: {0} (try 'help')")]
    Unknown(String),

    #[error("'{0}' needs a value")]
    MissingValue(&'static str),

    #[error("invalid duration {0:?}: {1}")]
    InvalidDuration(String, String),

    #[error("invalid drop rate {0:?}")]
    InvalidRate(String),
}

/// How a setting should change
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Change<T> {
    Set(T),
    Increase,
    Decrease,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Latency(Change<Duration>),
    Jitter(Change<Duration>),
    DropRate(Change<f64>),
    Status,
    ResetTraffic,
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return Ok(None);
    };
    let value = words.collect::<Vec<_>>().join(" ");

    let command = match name.to_ascii_lowercase().as_str() {
        "latency" | "l" => Command::Latency(duration_change("latency", &value)?),
        "jitter" | "j" => Command::Jitter(duration_change("jitter", &value)?),
        "drop" | "d" => Command::DropRate(rate_change(&value)?),
        "status" | "s" => Command::Status,
        "reset" => Command::ResetTraffic,
        "help" | "?" => Command::Help,
        "quit" | "q" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn duration_change(name: &'static str, value: &str) -> Result<Change<Duration>, CommandError> {
    match value {
        "" => Err(CommandError::MissingValue(name)),
        "+" => Ok(Change::Increase),
        "-" => Ok(Change::Decrease),
        v => humantime::parse_duration(v)
            .map(Change::Set)
            .map_err(|e| CommandError::InvalidDuration(v.to_string(), e.to_string())),
    }
}

fn rate_change(value: &str) -> Result<Change<f64>, CommandError> {
    match value {
        "" => Err(CommandError::MissingValue("drop")),
        "+" => Ok(Change::Increase),
        "-" => Ok(Change::Decrease),
        v => v
            .parse::<f64>()
            .map(Change::Set)
            .map_err(|_| CommandError::InvalidRate(v.to_string())),
    }
}

/// Apply a command to the state and return the text to show the user.
/// `None` means the console should stop.
pub fn apply(state: &HavocState, command: Command) -> Option<String> {
    match command {
        Command::Latency(change) => {
            match change {
                Change::Set(d) => state.set_latency(d),
                Change::Increase => state.adjust_latency(LATENCY_STEP_MS),
                Change::Decrease => state.adjust_latency(-LATENCY_STEP_MS),
            }
            Some(format!(
                "latency = {}",
                humantime::format_duration(state.chaos().latency)
            ))
        }
        Command::Jitter(change) => {
            match change {
                Change::Set(d) => state.set_jitter(d),
                Change::Increase => state.adjust_jitter(JITTER_STEP_MS),
                Change::Decrease => state.adjust_jitter(-JITTER_STEP_MS),
            }
            Some(format!(
                "jitter = {}",
                humantime::format_duration(state.chaos().jitter)
            ))
        }
        Command::DropRate(change) => {
            match change {
                Change::Set(r) => state.set_drop_rate(r),
                Change::Increase => state.adjust_drop_rate(DROP_RATE_STEP),
                Change::Decrease => state.adjust_drop_rate(-DROP_RATE_STEP),
            }
            Some(format!("drop rate = {:.2}", state.chaos().drop_rate))
        }
        Command::Status => Some(status(state)),
        Command::ResetTraffic => {
            state.traffic().reset();
            Some("traffic counters reset".to_string())
        }
        Command::Help => Some(HELP.to_string()),
        Command::Quit => None,
    }
}

fn status(state: &HavocState) -> String {
    let chaos = state.chaos();
    let conn = state.connection();
    let traffic = state.traffic().snapshot();
    format!(
        "listening on {}:{} -> {}\n\
         latency {} | jitter {} | drop rate {:.2}\n\
         connections: {} active, {} total\n\
         forwarded {} bytes, dropped {} bytes in {} chunks",
        conn.listen_ip,
        conn.listen_port,
        conn.target,
        humantime::format_duration(chaos.latency),
        humantime::format_duration(chaos.jitter),
        chaos.drop_rate,
        state.connections().active_count(),
        state.connections().total_count(),
        traffic.forwarded_bytes,
        traffic.dropped_bytes,
        traffic.dropped_chunks,
    )
}

/// Read commands from `input` until `quit` or end of input
pub async fn run<R, W>(state: &HavocState, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    output.write_all(b"type 'help' for commands\n").await?;
    output.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let reply = match parse_command(&line) {
            Ok(None) => continue,
            Ok(Some(command)) => match apply(state, command) {
                Some(reply) => reply,
                None => break,
            },
            Err(e) => e.to_string(),
        };
        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }

    Ok(())
}
