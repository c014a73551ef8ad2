//! Line protocol spoken by the breathalyzer.
//!
//! Outbound commands are ASCII keywords terminated by CRLF. Inbound lines are
//! either a bare echo of the command (`$START`) or a result frame of the form
//! `<head>,<quantity>-<status>`, e.g. `$RESULT,0.000-OK` or `$RESULT,1.125-HIGH`.

use std::fmt;

const LINE_ENDING: &str = "\r\n";
const RESULT_TAG: &str = "$RESULT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Reset,
}

impl Command {
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::Start => "$START",
            Command::Reset => "$RESET",
        }
    }

    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "$START" => Some(Command::Start),
            "$RESET" => Some(Command::Reset),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// The device's own classification of a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingStatus {
    Ok,
    High,
}

impl ReadingStatus {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "OK" => Some(ReadingStatus::Ok),
            "HIGH" => Some(ReadingStatus::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Ack(Command),
    Result { quantity: f64, status: ReadingStatus },
    Unrecognized(String),
    Empty,
}

pub fn encode(command: Command) -> Vec<u8> {
    format!("{}{}", command.keyword(), LINE_ENDING).into_bytes()
}

/// Classifies one inbound line. Never fails: anything that is not a well-formed
/// ack or result comes back as `Unrecognized`.
pub fn decode(raw: &str) -> DeviceEvent {
    let line = raw.trim();
    if line.is_empty() {
        return DeviceEvent::Empty;
    }

    match line.split_once(',') {
        Some((head, payload)) => {
            let head = head.trim();
            if head != RESULT_TAG && Command::from_keyword(head) != Some(Command::Start) {
                return DeviceEvent::Unrecognized(line.to_string());
            }
            match parse_reading(payload.trim()) {
                Some((quantity, status)) => DeviceEvent::Result { quantity, status },
                None => DeviceEvent::Unrecognized(line.to_string()),
            }
        }
        None => match Command::from_keyword(line) {
            Some(command) => DeviceEvent::Ack(command),
            None => DeviceEvent::Unrecognized(line.to_string()),
        },
    }
}

fn parse_reading(payload: &str) -> Option<(f64, ReadingStatus)> {
    let (quantity, tag) = payload.rsplit_once('-')?;
    let status = ReadingStatus::from_tag(tag.trim())?;
    let quantity = quantity.trim().parse::<f64>().ok()?;
    if !quantity.is_finite() || quantity < 0.0 {
        return None;
    }
    Some((quantity, status))
}
