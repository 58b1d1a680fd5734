//! Named application events exchanged over an authenticated channel.

/// Client → server: a user submission ([`UserMessage`](crate::message::UserMessage)).
pub const CHAT_MESSAGE: &str = "chat_message";

/// Client → server: stop generating for a conversation (data: the id).
pub const ABORT: &str = "abort";

/// Client → server: subscribe to a conversation's broadcast room.
pub const JOIN_CHAT_ROOM: &str = "join_chat_room";

/// Server → client: a streamed response chunk
/// ([`ServerMessage`](crate::message::ServerMessage)).
pub const SERVER_MESSAGE: &str = "server_message";

/// Server → client: a message posted by another participant of the room.
pub const CHAT_BROADCAST: &str = "chat_broadcast";

/// Server → client: the backend generated a title for a conversation.
pub const AUTOGEN_CHAT_TITLE: &str = "autogen_chat_title";
