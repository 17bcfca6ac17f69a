//! Callback receiver: HTTP endpoints the provider calls back with call status, speech input,
//! SMS delivery receipts and inbound SMS.

mod event_log;
mod parse;
mod routes;

pub use event_log::{EventLog, RawEvent};
pub use parse::{
    parse_inbound_sms, parse_sms_receipt, parse_voice_event, speech_summary, InboundSms,
    ParsedCallback, NO_INPUT_STATUS,
};
pub use routes::{router, CallbackState};
