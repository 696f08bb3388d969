use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Token kind used on the application-master to resource-manager channel.
/// Never shipped to worker containers.
pub const AM_RM_TOKEN_KIND: &str = "AM_RM_TOKEN";

/// An opaque delegation token granting scoped access to a cluster service on
/// behalf of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationToken {
    pub kind: String,
    pub service: String,
    pub identifier: Vec<u8>,
    pub password: Vec<u8>,
}

/// The delegation tokens of the current identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    tokens: Vec<DelegationToken>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_token(&mut self, token: DelegationToken) {
        self.tokens.push(token);
    }

    pub fn tokens(&self) -> &[DelegationToken] {
        &self.tokens
    }
}

/// Immutable serialized token set. `duplicate` hands out an independent view
/// over the shared backing bytes.
#[derive(Debug, Clone)]
pub struct TokenBlob {
    bytes: Arc<[u8]>,
}

impl TokenBlob {
    pub fn duplicate(&self) -> TokenBlob {
        TokenBlob {
            bytes: Arc::clone(&self.bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Serialize every token except the AM to RM token, which workers must not
/// be able to replay against the resource manager.
pub fn pack_credentials(credentials: &Credentials) -> Result<TokenBlob> {
    let shipped = Credentials {
        tokens: credentials
            .tokens
            .iter()
            .filter(|token| token.kind != AM_RM_TOKEN_KIND)
            .cloned()
            .collect(),
    };
    let bytes = serde_json::to_vec(&shipped)?;
    Ok(TokenBlob {
        bytes: bytes.into(),
    })
}

/// Restore the token set carried by a blob.
pub fn unpack_credentials(blob: &TokenBlob) -> Result<Credentials> {
    Ok(serde_json::from_slice(blob.as_bytes())?)
}
