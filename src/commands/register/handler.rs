//! Register command handler.

use super::parser::RegisterCommand;
use crate::commands::{CommandError, CommandHandler};
use crate::directory::Identity;
use tracing::info;

/// Executes register commands by logging the content against the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterHandler;

impl CommandHandler for RegisterHandler {
    fn handle(&self, identity: &Identity, payload: &[u8]) -> Result<(), CommandError> {
        let command = RegisterCommand::decode(payload)?;
        info!(
            user = %identity.id,
            email = %identity.email,
            content = %command.content,
            "Register"
        );
        Ok(())
    }
}
