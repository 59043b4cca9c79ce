//! Line-oriented control commands for the console host

use super::Intent;
use crate::error::{Result, SessionError};
use crate::protocol::{ChannelRequest, TargetKey};

pub const HELP: &str = "\
commands:
  toggle <relay>-<output>        flip a relay output
  blind <id> <0-999>             move a blind slider
  setpoint <value>               send a heating setpoint
  get-states                     ask for current relay states
  change-section <relay>-<output> <section>
  add-section <name>
  update-device <id> <type>
  update-relays | update-switches | update-root
  hide | show                    simulate page visibility
  refresh                        repaint every known output
  status                         print session statistics
  quit";

#[derive(Debug, Clone, PartialEq)]
pub enum LineCommand {
    Intent(Intent),
    Status,
    Help,
    Quit,
    Empty,
}

pub fn parse_line(line: &str) -> Result<LineCommand> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(LineCommand::Empty);
    };
    let args: Vec<&str> = words.collect();

    let intent = match (verb, args.as_slice()) {
        ("toggle", [target]) => Intent::Toggle(target.parse()?),
        ("blind", [blind, slider]) => Intent::MoveBlind {
            blind: blind.to_string(),
            slider: slider.parse().map_err(|_| {
                SessionError::invalid_input(format!("blind slider must be 0-999, got '{slider}'"))
            })?,
        },
        ("setpoint", [value]) => Intent::SetSetpoint(value.to_string()),
        ("get-states", []) => Intent::Request(ChannelRequest::GetStates),
        ("change-section", [target, section]) => {
            let target: TargetKey = target.parse()?;
            Intent::Request(ChannelRequest::ChangeSection {
                relay_id: target.device().to_string(),
                output_id: target.element().to_string(),
                section: section.to_string(),
            })
        }
        ("add-section", name) if !name.is_empty() => Intent::Request(ChannelRequest::AddSection {
            name: name.join(" "),
        }),
        ("update-device", [device_id, device_type]) => {
            Intent::Request(ChannelRequest::UpdateDevice {
                device_id: device_id.to_string(),
                device_type: device_type.to_string(),
            })
        }
        ("update-relays", []) => Intent::Request(ChannelRequest::UpdateAllRelays),
        ("update-switches", []) => Intent::Request(ChannelRequest::UpdateAllSwitches),
        ("update-root", []) => Intent::Request(ChannelRequest::UpdateRoot),
        ("hide", []) => Intent::Visibility(false),
        ("show", []) => Intent::Visibility(true),
        ("refresh", []) => Intent::Refresh,
        ("status", []) => return Ok(LineCommand::Status),
        ("help" | "?", []) => return Ok(LineCommand::Help),
        ("quit" | "exit", []) => return Ok(LineCommand::Quit),
        _ => {
            return Err(SessionError::invalid_input(format!(
                "unrecognised command '{}', try 'help'",
                line.trim()
            )))
        }
    };

    Ok(LineCommand::Intent(intent))
}
