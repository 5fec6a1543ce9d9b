use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeout for request/response round trips.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How often each side sends keepalive pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Read deadline: if *nothing* arrives within this window (no pong, no
/// response, no push event), the connection is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// A ping/pong round trip slower than this fires the slow-link warning.
pub const WS_SLOW_LINK: Duration = Duration::from_secs(2);

/// Maximum message size in bytes (1 MB). The protocol is small JSON
/// envelopes; anything larger is a malfunctioning peer.
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Reserved name of the administrative group that receives every
/// connect/disconnect membership notification. Clients must not register
/// under this name.
pub const ADMIN_GROUP_NAME: &str = "management";

/// Separator used for suffixed client-name variants. `deregister`
/// truncates the name at the first occurrence (when not leading) so
/// `"sensor-01_extra"` collapses to `"sensor-01"`.
pub const NAME_SUFFIX_SEPARATOR: char = '_';

/// Maximum number of positional arguments carried by a push event.
pub const MAX_EVENT_ARGS: usize = 7;

/// Default protocol version recorded for clients that register without one.
pub const DEFAULT_PROTOCOL_VERSION: i32 = 0;

/// Header carrying the static connection credential.
pub const AUTH_HEADER: &str = "x-groupcast-token";

/// Static credential value. A placeholder shared secret; real deployments
/// front the hub with their own auth layer.
pub const STATIC_AUTH_TOKEN: &str = "groupcast-dev-token";

/// Remote method: register the calling session under a client name.
pub const METHOD_REGISTER: &str = "register";
/// Remote method: remove the calling session's registration.
pub const METHOD_DEREGISTER: &str = "deregister";

/// Push event sent to the administrative group when a client registers.
pub const EVENT_CLIENT_CONNECTED: &str = "clientConnected";
/// Push event sent to the administrative group when a client goes away.
pub const EVENT_CLIENT_DISCONNECTED: &str = "clientDisconnected";

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Remote method call, client to hub.
    #[serde(rename = "invoke")]
    Invoke,
    /// Reply to an invoke, correlated by envelope id.
    #[serde(rename = "result")]
    Result,
    /// Push notification, hub to group members.
    #[serde(rename = "event")]
    Event,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Common wire error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_UNAUTHORIZED: i32 = 401;
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_serialization() {
        assert_eq!(
            serde_json::to_string(&MessageType::Invoke).unwrap(),
            "\"invoke\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::Event).unwrap(),
            "\"event\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::Result).unwrap(),
            "\"result\""
        );
    }

    #[test]
    fn message_type_deserialization() {
        let mt: MessageType = serde_json::from_str("\"invoke\"").unwrap();
        assert_eq!(mt, MessageType::Invoke);
    }

    #[test]
    fn unknown_message_type() {
        let mt: MessageType = serde_json::from_str("\"some_future_type\"").unwrap();
        assert_eq!(mt, MessageType::Unknown);
    }

    #[test]
    fn admin_group_name_is_not_a_valid_client_name() {
        // The reserved name must never collide with the suffix-normalized
        // form of itself, or deregister would route it to a real group.
        assert!(!ADMIN_GROUP_NAME.contains(NAME_SUFFIX_SEPARATOR));
    }
}
