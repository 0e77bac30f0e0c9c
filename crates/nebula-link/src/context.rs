//! Process-scoped client context and the authentication collaborator.

use std::sync::Arc;

use crate::config::LinkConfig;
use crate::message::{Message, MsgPackCodec, PayloadCodec};
use crate::store::{EndpointStore, MemoryEndpointStore};
use crate::value::Payload;

/// Identity provider consulted on every new connection.
pub trait Authenticator: Send + Sync {
    /// Login request to send once the transport is connected. `None` means
    /// the session is authenticated as soon as it connects.
    fn login_request(&self) -> Option<Message>;

    /// Inspect the login response. `Err` rejects the session for good.
    fn accept_login(&self, response: &Message) -> Result<(), String>;

    /// Current identity, if known.
    fn identity(&self) -> Option<String>;

    /// Message carried by the datagram handshake.
    fn handshake_message(&self) -> Message {
        let mut payload = Payload::new();
        if let Some(identity) = self.identity() {
            payload.insert("identity", identity);
        }
        Message::new("sys.handshake").with_payload(payload)
    }
}

/// Anonymous sessions: authenticated on connect.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn login_request(&self) -> Option<Message> {
        None
    }

    fn accept_login(&self, _response: &Message) -> Result<(), String> {
        Ok(())
    }

    fn identity(&self) -> Option<String> {
        None
    }
}

/// Everything a [`crate::Client`] needs, built once and passed in.
#[derive(Clone)]
pub struct ClientContext {
    pub config: LinkConfig,
    pub auth: Arc<dyn Authenticator>,
    pub store: Arc<dyn EndpointStore>,
    pub codec: Arc<dyn PayloadCodec>,
}

impl ClientContext {
    /// Context with anonymous auth, in-memory rotation and MessagePack payloads.
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            auth: Arc::new(NoAuth),
            store: Arc::new(MemoryEndpointStore::new()),
            codec: Arc::new(MsgPackCodec),
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn EndpointStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named;

    impl Authenticator for Named {
        fn login_request(&self) -> Option<Message> {
            Some(Message::new("user.login"))
        }

        fn accept_login(&self, response: &Message) -> Result<(), String> {
            match &response.error_code {
                Some(code) => Err(code.clone()),
                None => Ok(()),
            }
        }

        fn identity(&self) -> Option<String> {
            Some("player-1".to_string())
        }
    }

    #[test]
    fn test_handshake_carries_identity() {
        let handshake = Named.handshake_message();
        assert_eq!(handshake.msg_type, "sys.handshake");
        assert_eq!(handshake.payload.get("identity").and_then(|v| v.as_str()), Some("player-1"));
        assert!(NoAuth.handshake_message().payload.is_empty());
    }

    #[test]
    fn test_accept_login() {
        assert!(Named.accept_login(&Message::new("user.login")).is_ok());
        assert_eq!(
            Named.accept_login(&Message::new("user.login").with_error("BadToken")),
            Err("BadToken".to_string())
        );
    }
}
