use std::num::ParseIntError;

use thiserror::Error;

use crate::{is_identifier, Environment};

/// Operator commands accepted on the daemon's line-oriented control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    RoundStart {
        map: String,
        environment: Environment,
        round_index: u64,
        layer_id: Option<String>,
    },
    Preview,
    Reload,
    Status,
    Shutdown,
}

#[derive(Debug, Error)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("invalid integer '{value}' for {context}: {source}")]
    InvalidInteger {
        value: String,
        context: &'static str,
        source: ParseIntError,
    },
    #[error("invalid environment '{0}'")]
    InvalidEnvironment(String),
    #[error("invalid map identifier '{0}'")]
    InvalidIdentifier(String),
}

pub fn parse_command_line(input: &str) -> Result<OperatorCommand, CommandParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CommandParseError::Empty);
    }

    let mut parts = trimmed.split_whitespace();
    let verb = parts
        .next()
        .map(|v| v.to_ascii_lowercase())
        .ok_or(CommandParseError::Empty)?;

    match verb.as_str() {
        "round_start" | "round" => {
            let map = parts
                .next()
                .ok_or(CommandParseError::MissingArgument("map"))?;
            let environment_str = parts
                .next()
                .ok_or(CommandParseError::MissingArgument("environment"))?;
            let index_str = parts
                .next()
                .ok_or(CommandParseError::MissingArgument("round_index"))?;
            if !is_identifier(map) {
                return Err(CommandParseError::InvalidIdentifier(map.to_string()));
            }
            let environment = environment_str
                .parse::<Environment>()
                .map_err(|_| CommandParseError::InvalidEnvironment(environment_str.to_string()))?;
            let round_index = parse_u64(index_str, "round index")?;
            let layer_id = match parts.next() {
                Some(layer) if is_identifier(layer) => Some(layer.to_string()),
                Some(layer) => return Err(CommandParseError::InvalidIdentifier(layer.to_string())),
                None => None,
            };
            Ok(OperatorCommand::RoundStart {
                map: map.to_string(),
                environment,
                round_index,
                layer_id,
            })
        }
        "preview" => Ok(OperatorCommand::Preview),
        "reload" => Ok(OperatorCommand::Reload),
        "status" => Ok(OperatorCommand::Status),
        "shutdown" | "quit" => Ok(OperatorCommand::Shutdown),
        other => Err(CommandParseError::UnknownCommand(other.to_string())),
    }
}

fn parse_u64(value: &str, context: &'static str) -> Result<u64, CommandParseError> {
    value
        .parse::<u64>()
        .map_err(|source| CommandParseError::InvalidInteger {
            value: value.to_string(),
            context,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_round_start() {
        let command = parse_command_line("  ROUND_START carentan Night 42 ").unwrap();
        assert_eq!(
            command,
            OperatorCommand::RoundStart {
                map: "carentan".to_string(),
                environment: Environment::Night,
                round_index: 42,
                layer_id: None,
            }
        );
    }

    #[test]
    fn round_start_may_name_the_layer() {
        let command = parse_command_line("round foy night 7 foy_warfare_night").unwrap();
        assert!(matches!(
            command,
            OperatorCommand::RoundStart { layer_id: Some(layer), round_index: 7, .. }
                if layer == "foy_warfare_night"
        ));
        assert!(matches!(
            parse_command_line("round foy night 7 foy-warfare"),
            Err(CommandParseError::InvalidIdentifier(value)) if value == "foy-warfare"
        ));
    }

    #[test]
    fn parses_bare_verbs() {
        assert_eq!(parse_command_line("preview").unwrap(), OperatorCommand::Preview);
        assert_eq!(parse_command_line("reload").unwrap(), OperatorCommand::Reload);
        assert_eq!(parse_command_line("status").unwrap(), OperatorCommand::Status);
        assert_eq!(parse_command_line("quit").unwrap(), OperatorCommand::Shutdown);
    }

    #[test]
    fn reports_argument_problems() {
        assert!(matches!(parse_command_line("   "), Err(CommandParseError::Empty)));
        assert!(matches!(
            parse_command_line("round_start foy"),
            Err(CommandParseError::MissingArgument("environment"))
        ));
        assert!(matches!(
            parse_command_line("round_start foy dusk next"),
            Err(CommandParseError::InvalidInteger { context: "round index", .. })
        ));
        assert!(matches!(
            parse_command_line("round_start foy sunset 3"),
            Err(CommandParseError::InvalidEnvironment(value)) if value == "sunset"
        ));
        assert!(matches!(
            parse_command_line("round_start st-mere day 3"),
            Err(CommandParseError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            parse_command_line("rotate"),
            Err(CommandParseError::UnknownCommand(verb)) if verb == "rotate"
        ));
    }
}
