//! Command registry and handlers.
//!
//! Each authenticated frame starts with an action code. The registry maps
//! that code to the handler which decodes and executes the payload.
//!
//! ## Actions
//! - `register` (`'1'`): record a piece of content for the caller

pub mod register;

use crate::directory::Identity;
use std::collections::HashMap;
use thiserror::Error;

/// Actions a client may request once logged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Register,
}

impl Action {
    /// Every known action.
    pub const ALL: [Action; 1] = [Action::Register];

    /// Wire code identifying this action.
    pub fn code(self) -> u8 {
        match self {
            Action::Register => b'1',
        }
    }

    pub fn from_code(code: u8) -> Option<Action> {
        Self::ALL.into_iter().find(|action| action.code() == code)
    }
}

/// Command execution errors
#[derive(Debug, Error)]
pub enum CommandError {
    /// Payload did not match the shape the action expects.
    #[error("could not parse command: {0}")]
    Decode(#[from] serde_json::Error),
    /// Payload decoded but the command refused to run.
    #[error("command rejected: {0}")]
    Rejected(String),
}

/// Decodes and executes one action.
pub trait CommandHandler {
    fn handle(&self, identity: &Identity, payload: &[u8]) -> Result<(), CommandError>;
}

impl<F> CommandHandler for F
where
    F: Fn(&Identity, &[u8]) -> Result<(), CommandError>,
{
    fn handle(&self, identity: &Identity, payload: &[u8]) -> Result<(), CommandError> {
        self(identity, payload)
    }
}

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a handler is already registered for {0:?}")]
    Duplicate(Action),
}

/// Outcome of dispatching one frame.
#[derive(Debug)]
pub enum Dispatch {
    /// The handler ran.
    Executed,
    /// The handler could not decode or execute the payload.
    Failed(CommandError),
    /// No handler is registered for the action code.
    Unknown,
}

impl Dispatch {
    pub fn is_success(&self) -> bool {
        matches!(self, Dispatch::Executed)
    }
}

/// Maps action codes to handlers. Filled at startup, read-only afterwards.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<Action, Box<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in action wired to its handler.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for action in Action::ALL {
            let handler: Box<dyn CommandHandler> = match action {
                Action::Register => Box::new(register::RegisterHandler),
            };
            registry.handlers.insert(action, handler);
        }
        registry
    }

    pub fn register<H>(&mut self, action: Action, handler: H) -> Result<(), RegistryError>
    where
        H: CommandHandler + 'static,
    {
        if self.handlers.contains_key(&action) {
            return Err(RegistryError::Duplicate(action));
        }
        self.handlers.insert(action, Box::new(handler));
        Ok(())
    }

    pub fn contains(&self, code: u8) -> bool {
        Action::from_code(code).is_some_and(|action| self.handlers.contains_key(&action))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `code` against `payload`.
    pub fn dispatch(&self, code: u8, identity: &Identity, payload: &[u8]) -> Dispatch {
        let Some(handler) = Action::from_code(code).and_then(|action| self.handlers.get(&action))
        else {
            return Dispatch::Unknown;
        };

        match handler.handle(identity, payload) {
            Ok(()) => Dispatch::Executed,
            Err(e) => Dispatch::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Role, UserDirectory};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn student() -> Identity {
        let mut directory = UserDirectory::new();
        directory
            .register(crate::directory::NewUser {
                first_name: "Tony".to_string(),
                last_name: "Stark".to_string(),
                email: "tony@stark.com".to_string(),
                password: "ironman".to_string(),
                role: Role::Student,
            })
            .unwrap()
    }

    #[test]
    fn test_action_codes() {
        assert_eq!(Action::Register.code(), b'1');
        assert_eq!(Action::from_code(b'1'), Some(Action::Register));
        assert_eq!(Action::from_code(b'9'), None);
        assert_eq!(Action::from_code(b'0'), None);
    }

    #[test]
    fn test_dispatch_known_action() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);

        let mut registry = CommandRegistry::new();
        registry
            .register(
                Action::Register,
                move |_: &Identity, payload: &[u8]| -> Result<(), CommandError> {
                    let command = register::RegisterCommand::decode(payload)?;
                    sink.borrow_mut().push(command.content);
                    Ok(())
                },
            )
            .unwrap();

        let outcome = registry.dispatch(b'1', &student(), br#"{"Content":"hello"}"#);
        assert!(outcome.is_success());
        assert_eq!(*seen.borrow(), vec!["hello".to_string()]);
    }

    #[test]
    fn test_dispatch_unknown_action() {
        let registry = CommandRegistry::with_defaults();
        assert!(matches!(
            registry.dispatch(b'9', &student(), b"{}"),
            Dispatch::Unknown
        ));
        assert!(!registry.contains(b'9'));
        assert!(registry.contains(b'1'));
    }

    #[test]
    fn test_dispatch_decode_failure() {
        let registry = CommandRegistry::with_defaults();
        let outcome = registry.dispatch(b'1', &student(), br#"{"Wrong":"field"}"#);
        assert!(matches!(outcome, Dispatch::Failed(CommandError::Decode(_))));
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = CommandRegistry::with_defaults();
        assert_eq!(
            registry.register(Action::Register, register::RegisterHandler),
            Err(RegistryError::Duplicate(Action::Register))
        );
        assert_eq!(registry.len(), 1);
    }
}
