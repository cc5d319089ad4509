pub mod formatter;
pub mod manager;
mod messages;

pub use manager::{
    slash_command_definitions, Manager, COMMAND_MOJIOKOSHI, COMMAND_MOJIOKOSHI_STOP,
    STOP_REASON_BOT_REMOVED, STOP_REASON_MANUAL_SLASH, STOP_REASON_MAX_DURATION,
    STOP_REASON_PARTICIPANTS_LEFT, STOP_REASON_SERVER_CLOSED, STOP_REASON_UNKNOWN_ERROR,
};
