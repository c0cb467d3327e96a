//! Protocol module - UCI packet definitions.

pub mod constants;
pub mod notification;
pub mod packet;

pub use constants::*;
pub use notification::{Notification, NotificationCode, SessionIndicator};
pub use packet::{CodecError, Command, Opcode, PacketKind, classify, decode, decode_count, encode};
