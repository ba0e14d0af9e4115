//! User directory seam
//!
//! Identification maps an opaque token to a peer id. Deployments plug in
//! their own directory (account database, auth service); the default
//! accepts tokens that already are peer ids, which is what the test
//! clients and local development use.

use uuid::Uuid;

use voxcast_protocol::PeerId;

pub trait UserDirectory: Send + Sync {
    /// Resolves a signaling token to a peer id, or `None` when the token
    /// is not recognized.
    fn resolve(&self, token: &str) -> Option<PeerId>;
}

/// Directory that accepts any UUID-shaped token as the peer id itself.
#[derive(Debug, Default)]
pub struct UuidDirectory;

impl UserDirectory for UuidDirectory {
    fn resolve(&self, token: &str) -> Option<PeerId> {
        token.parse::<Uuid>().ok().map(PeerId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_tokens_resolve_to_themselves() {
        let peer_id = PeerId::new();
        let resolved = UuidDirectory.resolve(&peer_id.to_string());
        assert_eq!(resolved, Some(peer_id));
    }

    #[test]
    fn garbage_tokens_do_not_resolve() {
        assert_eq!(UuidDirectory.resolve("not-a-peer"), None);
    }
}
