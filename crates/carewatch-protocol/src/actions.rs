// Inbound action names and fixed outbound texts understood by dashboard clients.

pub const SUBSCRIBE: &str = "subscribe";
pub const UNSUBSCRIBE: &str = "unsubscribe";

pub const INVALID_MESSAGE_FORMAT: &str = "Invalid message format";
