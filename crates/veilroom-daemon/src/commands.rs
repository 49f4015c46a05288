//! Room administration commands and their dispatch table.
//!
//! The registry is a value handed to each room rather than process-global
//! state, so tests stay isolated and dispatch stays pure. Handlers check
//! authorization before touching anything; a failing command leaves the
//! room untouched while the message itself stays in history.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use thiserror::Error;
use tracing::info;

use veilroom_shared::constants::COMMAND_DELIMITER;
use veilroom_shared::{ContentType, Message, RemoteIdentity};

use crate::error::RoomError;
use crate::room::Room;

pub const CMD_INVITE: &str = "invite";
pub const CMD_NAME_ROOM: &str = "name_room";
pub const CMD_NICK: &str = "nick";
pub const CMD_PROMOTE: &str = "promote";
pub const CMD_REMOVE: &str = "remove";

// No-op, used by front-ends as a presence indicator.
pub const CMD_ACCEPT: &str = "accept";

/// What the caller has to do after a command ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEffect {
    None,
    /// The local member was removed; drop the room from the registry.
    DeleteRoom,
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Message is not a command")]
    NotACommand,

    #[error("Command {0} is already registered")]
    AlreadyRegistered(String),

    #[error("Command {0} is not registered")]
    NotRegistered(String),

    #[error("Command {0} does not have enough arguments")]
    NotEnoughArgs(String),

    #[error("Command payload is not valid UTF-8")]
    InvalidPayload,

    #[error("Invalid fingerprint argument {0}")]
    InvalidFingerprint(String),

    #[error("Peer {0} is not an admin")]
    NotAdmin(String),

    #[error(transparent)]
    Room(#[from] RoomError),
}

pub type CommandHandler =
    Box<dyn Fn(&str, &Message, &Room) -> Result<CommandEffect, CommandError> + Send + Sync>;

#[derive(Default)]
pub struct CommandRegistry {
    handlers: RwLock<HashMap<String, CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the six room commands pre-registered.
    pub fn with_room_commands() -> Self {
        let registry = Self::new();
        registry
            .register(CMD_INVITE, Box::new(invite))
            .and_then(|_| registry.register(CMD_NAME_ROOM, Box::new(name_room)))
            .and_then(|_| registry.register(CMD_NICK, Box::new(nick)))
            .and_then(|_| registry.register(CMD_PROMOTE, Box::new(promote)))
            .and_then(|_| registry.register(CMD_REMOVE, Box::new(remove)))
            .and_then(|_| registry.register(CMD_ACCEPT, Box::new(accept)))
            .expect("built-in command names are distinct");
        registry
    }

    pub fn register(&self, name: &str, handler: CommandHandler) -> Result<(), CommandError> {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(name) {
            return Err(CommandError::AlreadyRegistered(name.to_string()));
        }
        handlers.insert(name.to_string(), handler);
        Ok(())
    }

    /// Parse the first token of a command message and run its handler.
    pub fn dispatch(&self, message: &Message, room: &Room) -> Result<CommandEffect, CommandError> {
        if message.content_type != ContentType::Command {
            return Err(CommandError::NotACommand);
        }
        let name = message.command_name().ok_or(CommandError::InvalidPayload)?;

        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let handler = handlers
            .get(name)
            .ok_or_else(|| CommandError::NotRegistered(name.to_string()))?;
        handler(name, message, room)
    }

    /// Wipe the table. For test isolation.
    pub fn clean(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn args_of(name: &str, message: &Message, expected: usize) -> Result<Vec<String>, CommandError> {
    let payload =
        std::str::from_utf8(&message.content).map_err(|_| CommandError::InvalidPayload)?;
    let args: Vec<String> = payload
        .split(COMMAND_DELIMITER)
        .map(str::to_string)
        .collect();
    if args.len() < expected {
        return Err(CommandError::NotEnoughArgs(name.to_string()));
    }
    Ok(args)
}

fn require_admin(message: &Message, room: &Room) -> Result<(), CommandError> {
    if !room.is_admin(&message.sender) {
        return Err(CommandError::NotAdmin(message.sender.clone()));
    }
    Ok(())
}

fn invite(name: &str, message: &Message, room: &Room) -> Result<CommandEffect, CommandError> {
    let args = args_of(name, message, 2)?;
    let remote = RemoteIdentity::from_fingerprint(&args[1])
        .map_err(|_| CommandError::InvalidFingerprint(args[1].clone()))?;

    room.add_peer(remote)?;
    Ok(CommandEffect::None)
}

fn name_room(name: &str, message: &Message, room: &Room) -> Result<CommandEffect, CommandError> {
    let args = args_of(name, message, 2)?;
    room.set_name(&args[1]);
    info!(room = %room.id(), name = %args[1], "Room renamed");
    Ok(CommandEffect::None)
}

fn nick(name: &str, message: &Message, room: &Room) -> Result<CommandEffect, CommandError> {
    let args = args_of(name, message, 2)?;
    room.set_nick(&message.sender, &args[1])?;
    info!(peer = %message.sender, nick = %args[1], "Nickname set");
    Ok(CommandEffect::None)
}

fn promote(name: &str, message: &Message, room: &Room) -> Result<CommandEffect, CommandError> {
    let args = args_of(name, message, 2)?;
    require_admin(message, room)?;
    room.promote(&args[1])?;
    info!(peer = %args[1], "Peer promoted to admin");
    Ok(CommandEffect::None)
}

fn remove(name: &str, message: &Message, room: &Room) -> Result<CommandEffect, CommandError> {
    let args = args_of(name, message, 2)?;
    require_admin(message, room)?;

    if args[1] == room.fingerprint() {
        // We were removed: go inert and let the caller drop the room.
        room.stop_queues();
        info!(room = %room.id(), "Local member removed, room shutting down");
        return Ok(CommandEffect::DeleteRoom);
    }

    room.remove_peer(&args[1]);
    Ok(CommandEffect::None)
}

fn accept(_name: &str, _message: &Message, _room: &Room) -> Result<CommandEffect, CommandError> {
    Ok(CommandEffect::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use veilroom_net::StaticDialer;
    use veilroom_shared::{construct_command, Identity};
    use veilroom_store::BlobStore;

    async fn room_with_registry(registry: CommandRegistry) -> (Room, TempDir) {
        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(BlobStore::new(dir.path().to_path_buf()).await.unwrap());
        let room = Room::new(
            Identity::generate(),
            blobs,
            Arc::new(StaticDialer::new()),
            Arc::new(registry),
        );
        (room, dir)
    }

    fn command_message(identity: &Identity, payload: &[u8]) -> Message {
        Message::signed(identity, ContentType::Command, payload.to_vec())
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> CommandHandler {
        Box::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(CommandEffect::None)
        })
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let registry = CommandRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry
            .register("test", counting_handler(calls.clone()))
            .unwrap();
        let second = registry.register("test", Box::new(|_, _, _| Ok(CommandEffect::None)));
        assert!(matches!(second, Err(CommandError::AlreadyRegistered(_))));

        // first handler stays bound
        let (room, _dir) = room_with_registry(CommandRegistry::new()).await;
        let msg = command_message(&Identity::generate(), b"test");
        registry.dispatch(&msg, &room).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_non_command() {
        let registry = CommandRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register("test", counting_handler(calls.clone()))
            .unwrap();

        let (room, _dir) = room_with_registry(CommandRegistry::new()).await;
        let msg = Message::signed(&Identity::generate(), ContentType::Text, b"test".to_vec());

        assert!(matches!(
            registry.dispatch(&msg, &room),
            Err(CommandError::NotACommand)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_unregistered() {
        let registry = CommandRegistry::new();
        let (room, _dir) = room_with_registry(CommandRegistry::new()).await;
        let msg = command_message(&Identity::generate(), b"test");

        assert!(matches!(
            registry.dispatch(&msg, &room),
            Err(CommandError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_clean_unbinds_handlers() {
        let registry = CommandRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register("test", counting_handler(calls.clone()))
            .unwrap();

        registry.clean();

        let (room, _dir) = room_with_registry(CommandRegistry::new()).await;
        let msg = command_message(&Identity::generate(), b"test");
        assert!(matches!(
            registry.dispatch(&msg, &room),
            Err(CommandError::NotRegistered(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invite_adds_peer() {
        let (room, _dir) = room_with_registry(CommandRegistry::with_room_commands()).await;
        let invited = Identity::generate();

        let payload = construct_command(invited.fingerprint().as_bytes(), CMD_INVITE);
        room.post(ContentType::Command, payload);

        assert!(room.has_peer(&invited.fingerprint()));
        // the command stays in history
        assert_eq!(room.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_invite_rejects_existing_member() {
        let (room, _dir) = room_with_registry(CommandRegistry::with_room_commands()).await;
        let registry = CommandRegistry::with_room_commands();
        let invited = Identity::generate();
        let remote = RemoteIdentity::from_fingerprint(&invited.fingerprint()).unwrap();
        room.add_peer(remote).unwrap();

        let msg = command_message(
            &Identity::generate(),
            &construct_command(invited.fingerprint().as_bytes(), CMD_INVITE),
        );
        assert!(matches!(
            registry.dispatch(&msg, &room),
            Err(CommandError::Room(RoomError::DuplicatePeer(_)))
        ));
    }

    #[tokio::test]
    async fn test_name_room_and_nick() {
        let (room, _dir) = room_with_registry(CommandRegistry::with_room_commands()).await;

        room.post(
            ContentType::Command,
            construct_command(b"hideout", CMD_NAME_ROOM),
        );
        assert_eq!(room.name().as_deref(), Some("hideout"));

        room.post(ContentType::Command, construct_command(b"alice", CMD_NICK));
        let meta = room.peer_meta(&room.fingerprint()).unwrap();
        assert_eq!(meta.nick.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_promote_requires_admin() {
        let (room, _dir) = room_with_registry(CommandRegistry::with_room_commands()).await;
        let registry = CommandRegistry::with_room_commands();

        let member = Identity::generate();
        let target = Identity::generate();
        room.add_peer(RemoteIdentity::from_fingerprint(&member.fingerprint()).unwrap())
            .unwrap();
        room.add_peer(RemoteIdentity::from_fingerprint(&target.fingerprint()).unwrap())
            .unwrap();

        // a non-admin member cannot promote
        let msg = command_message(
            &member,
            &construct_command(target.fingerprint().as_bytes(), CMD_PROMOTE),
        );
        assert!(matches!(
            registry.dispatch(&msg, &room),
            Err(CommandError::NotAdmin(_))
        ));
        assert!(!room.is_admin(&target.fingerprint()));

        // the admin creator can
        room.post(
            ContentType::Command,
            construct_command(target.fingerprint().as_bytes(), CMD_PROMOTE),
        );
        assert!(room.is_admin(&target.fingerprint()));
    }

    #[tokio::test]
    async fn test_remove_peer_command() {
        let (room, _dir) = room_with_registry(CommandRegistry::with_room_commands()).await;
        let member = Identity::generate();
        room.add_peer(RemoteIdentity::from_fingerprint(&member.fingerprint()).unwrap())
            .unwrap();

        room.post(
            ContentType::Command,
            construct_command(member.fingerprint().as_bytes(), CMD_REMOVE),
        );
        assert!(!room.has_peer(&member.fingerprint()));
    }

    #[tokio::test]
    async fn test_remove_self_requests_room_deletion() {
        let (room, _dir) = room_with_registry(CommandRegistry::with_room_commands()).await;

        let effect = room.post(
            ContentType::Command,
            construct_command(room.fingerprint().as_bytes(), CMD_REMOVE),
        );
        assert_eq!(effect, CommandEffect::DeleteRoom);
    }

    #[tokio::test]
    async fn test_malformed_command_mutates_nothing() {
        let (room, _dir) = room_with_registry(CommandRegistry::with_room_commands()).await;
        let registry = CommandRegistry::with_room_commands();

        // missing argument
        let msg = command_message(&Identity::generate(), CMD_NAME_ROOM.as_bytes());
        assert!(matches!(
            registry.dispatch(&msg, &room),
            Err(CommandError::NotEnoughArgs(_))
        ));
        assert_eq!(room.name(), None);

        // unknown command
        let msg = command_message(&Identity::generate(), b"frobnicate now");
        assert!(matches!(
            registry.dispatch(&msg, &room),
            Err(CommandError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_is_a_noop() {
        let (room, _dir) = room_with_registry(CommandRegistry::with_room_commands()).await;
        let effect = room.post(ContentType::Command, CMD_ACCEPT.as_bytes().to_vec());
        assert_eq!(effect, CommandEffect::None);
        assert_eq!(room.messages().len(), 1);
    }
}
