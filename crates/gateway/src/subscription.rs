//! Channel name validation.
//!
//! Channels map one-to-one onto upstream subscriptions, so glob
//! metacharacters are rejected: a client cannot widen its subscription past
//! the channels it names.

/// Longest accepted channel name, in bytes.
pub const MAX_CHANNEL_LEN: usize = 256;

/// Validate a channel name requested by a client.
/// Returns an error message if invalid, None if valid.
pub fn validate_channel(channel: &str) -> Option<String> {
    if channel.is_empty() {
        return Some("Empty channel".to_string());
    }

    if channel.len() > MAX_CHANNEL_LEN {
        return Some(format!("Channel longer than {} bytes", MAX_CHANNEL_LEN));
    }

    if channel.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Some("Channel contains whitespace or control characters".to_string());
    }

    if channel.chars().any(|c| matches!(c, '*' | '?' | '[' | ']')) {
        return Some("Wildcard channels are not supported".to_string());
    }

    if channel.starts_with("__key") {
        return Some("Keyspace channels are reserved".to_string());
    }

    None
}
