//! Line-oriented stand-in for the presentation layer.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::agent::{DeviceHandle, OperatorCommand};
use crate::device::LocalEdit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Edit(LocalEdit),
    Operator(OperatorCommand),
    Status,
}

const HELP: &str = "commands: toggle | enable | disable | temp <n> | flow <n> | \
                    connect | disconnect | status | quit";

pub fn parse_line(line: &str) -> Result<Input, String> {
    let mut words = line.split_whitespace();
    let cmd = words.next().ok_or_else(|| HELP.to_string())?;
    let arg = words.next();
    if words.next().is_some() {
        return Err(format!("too many arguments ({HELP})"));
    }

    let number = |name: &str| -> Result<i32, String> {
        arg.ok_or_else(|| format!("{name} needs a value"))?
            .parse()
            .map_err(|e| format!("invalid {name} value: {e}"))
    };

    let input = match cmd.to_ascii_lowercase().as_str() {
        "toggle" => Input::Edit(LocalEdit::ToggleEnabled),
        "enable" | "on" => Input::Edit(LocalEdit::SetEnabled(true)),
        "disable" | "off" => Input::Edit(LocalEdit::SetEnabled(false)),
        "temp" | "temperature" => Input::Edit(LocalEdit::SetTargetTemperature(number("temp")?)),
        "flow" | "airflow" => Input::Edit(LocalEdit::SetAirFlow(number("flow")?)),
        "connect" => Input::Operator(OperatorCommand::Connect),
        "disconnect" => Input::Operator(OperatorCommand::Disconnect),
        "status" => Input::Status,
        "quit" | "exit" => Input::Operator(OperatorCommand::Shutdown),
        other => return Err(format!("unknown command '{other}' ({HELP})")),
    };
    let takes_value = matches!(
        input,
        Input::Edit(LocalEdit::SetTargetTemperature(_) | LocalEdit::SetAirFlow(_))
    );
    if arg.is_some() && !takes_value {
        return Err(format!("'{cmd}' takes no arguments"));
    }
    Ok(input)
}

/// Read commands from stdin until EOF or `quit`.
pub async fn read_commands(handle: DeviceHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Console ready; {}", HELP);

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let delivered = match parse_line(&line) {
            Ok(Input::Edit(edit)) => handle.edit(edit).await,
            Ok(Input::Operator(command)) => {
                let delivered = handle.operator(command).await;
                if command == OperatorCommand::Shutdown {
                    break;
                }
                delivered
            }
            Ok(Input::Status) => {
                info!("{} | {:?}", handle.state(), handle.connection_status());
                true
            }
            Err(e) => {
                warn!("{}", e);
                true
            }
        };
        if !delivered {
            break;
        }
    }
}

/// Log every state and connection change, like a refreshing display would.
pub async fn observe(handle: DeviceHandle) {
    let mut state = handle.watch_state();
    let mut status = handle.watch_status();

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("State: {}", *state.borrow_and_update());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("Connection: {:?}", *status.borrow_and_update());
            }
        }
    }
}
