//! Line commands understood by the `pumplink` terminal client.

use chrono::{DateTime, Utc};
use pumplink_core::{CoreError, parse_timestamp, validate_arm_minutes};

pub const HELP: &str =
    "commands: fg | bg | arm <minutes> | dial <degrees> | schedule <rfc3339> <minutes> | status | logout | quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Foreground,
    Background,
    Arm(u32),
    /// Turn the dial to this angle, then arm for what it reads.
    Dial(f64),
    Schedule { start: DateTime<Utc>, minutes: u32 },
    Status,
    Logout,
    Quit,
    Help,
}

impl ConsoleCommand {
    /// `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };

        let command = match verb.to_ascii_lowercase().as_str() {
            "fg" | "foreground" => Self::Foreground,
            "bg" | "background" => Self::Background,
            "arm" => Self::Arm(parse_minutes(words.next())?),
            "dial" => Self::Dial(parse_degrees(words.next())?),
            "schedule" => {
                let start = words
                    .next()
                    .ok_or_else(|| "schedule needs a start time".to_owned())
                    .and_then(|input| parse_timestamp(input).map_err(describe))?;
                Self::Schedule {
                    start,
                    minutes: parse_minutes(words.next())?,
                }
            }
            "status" => Self::Status,
            "logout" => Self::Logout,
            "quit" | "exit" => Self::Quit,
            "help" | "?" => Self::Help,
            other => return Err(format!("unknown command `{other}`; {HELP}")),
        };

        if let Some(extra) = words.next() {
            return Err(format!("unexpected argument `{extra}`"));
        }
        Ok(Some(command))
    }
}

fn parse_minutes(word: Option<&str>) -> Result<u32, String> {
    let word = word.ok_or_else(|| "missing duration in minutes".to_owned())?;
    let minutes: u32 = word
        .parse()
        .map_err(|_| format!("`{word}` is not a whole number of minutes"))?;
    validate_arm_minutes(minutes).map_err(describe)?;
    Ok(minutes)
}

fn parse_degrees(word: Option<&str>) -> Result<f64, String> {
    let word = word.ok_or_else(|| "missing dial angle in degrees".to_owned())?;
    match word.parse::<f64>() {
        Ok(degrees) if (0.0..360.0).contains(&degrees) => Ok(degrees),
        _ => Err(format!("`{word}` is not an angle between 0 and 360")),
    }
}

fn describe(err: CoreError) -> String {
    err.to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn parses_every_verb() {
        assert_eq!(ConsoleCommand::parse("fg"), Ok(Some(ConsoleCommand::Foreground)));
        assert_eq!(ConsoleCommand::parse(" BG "), Ok(Some(ConsoleCommand::Background)));
        assert_eq!(ConsoleCommand::parse("arm 12"), Ok(Some(ConsoleCommand::Arm(12))));
        assert_eq!(ConsoleCommand::parse("dial 155"), Ok(Some(ConsoleCommand::Dial(155.0))));
        assert_eq!(ConsoleCommand::parse("dial 4.5"), Ok(Some(ConsoleCommand::Dial(4.5))));
        assert_eq!(ConsoleCommand::parse("status"), Ok(Some(ConsoleCommand::Status)));
        assert_eq!(ConsoleCommand::parse("logout"), Ok(Some(ConsoleCommand::Logout)));
        assert_eq!(ConsoleCommand::parse("quit"), Ok(Some(ConsoleCommand::Quit)));
        assert_eq!(ConsoleCommand::parse(""), Ok(None));
    }

    #[test]
    fn schedule_takes_timestamp_and_minutes() {
        let parsed = ConsoleCommand::parse("schedule 2025-03-01T11:15:00+01:00 20").unwrap();
        assert_eq!(
            parsed,
            Some(ConsoleCommand::Schedule {
                start: Utc.with_ymd_and_hms(2025, 3, 1, 10, 15, 0).unwrap(),
                minutes: 20,
            })
        );
    }

    #[test]
    fn rejects_bad_durations_and_extra_words() {
        assert!(ConsoleCommand::parse("arm").is_err());
        assert!(ConsoleCommand::parse("arm ten").is_err());
        assert!(ConsoleCommand::parse("arm 0").is_err());
        assert!(ConsoleCommand::parse("arm 31").is_err());
        assert!(ConsoleCommand::parse("arm 5 now").is_err());
        assert!(ConsoleCommand::parse("schedule tomorrow 5").is_err());
        assert!(ConsoleCommand::parse("dial").is_err());
        assert!(ConsoleCommand::parse("dial 360").is_err());
        assert!(ConsoleCommand::parse("dial -5").is_err());
        assert!(ConsoleCommand::parse("dial NaN").is_err());
        assert!(ConsoleCommand::parse("dance").is_err());
    }
}
