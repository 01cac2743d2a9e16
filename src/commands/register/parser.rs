//! Register command parser.

use serde::Deserialize;

/// Parsed register command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisterCommand {
    #[serde(rename = "Content")]
    pub content: String,
}

impl RegisterCommand {
    /// Decode the JSON payload of a register frame.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register() {
        let command = RegisterCommand::decode(br#"{"Content":"hello"}"#).unwrap();
        assert_eq!(command.content, "hello");
    }

    #[test]
    fn test_parse_with_whitespace() {
        let command = RegisterCommand::decode(b" { \"Content\" : \"\" } ").unwrap();
        assert_eq!(command.content, "");
    }

    #[test]
    fn test_missing_content() {
        assert!(RegisterCommand::decode(b"{}").is_err());
    }

    #[test]
    fn test_wrong_type() {
        assert!(RegisterCommand::decode(br#"{"Content":42}"#).is_err());
        assert!(RegisterCommand::decode(b"null").is_err());
    }
}
