//! Communication channels (Telegram).
//!
//! A channel provides the upstream side (receiving messages to forward) and the outbound side
//! (relaying them to targets).

mod inbound;
mod telegram;

pub use inbound::{message_id, InboundMessage, MediaRef, Payload};
pub use telegram::{classify_response, ApiResponse, BotIdentity, TelegramChannel, TelegramUpdate, TELEGRAM_API_BASE};
