//! 记忆层：请求内的对话消息

pub mod conversation;

pub use conversation::{last_user_content, Message, Role};
