mod expiry;
mod feed;
mod group;
mod log;
mod model;
mod stream;

pub use group::{MessageGroup, group_messages};
pub use log::MessageLog;
pub use model::{
    Attachment, Cursor, LogEvent, Message, MessageDraft, MessageKind, MessageState, ReplyPreview,
};
pub use stream::LogStream;
