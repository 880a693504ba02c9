//! Authenticated request identity

use serde::{Deserialize, Serialize};

/// The identity attached to a gated request, resolved once at the gate.
///
/// End users always act on behalf of a registered client organization, so
/// both variants carry the client id used for rate limiting and usage
/// accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    /// An end user of a client organization
    User { user_id: String, client_id: String },
    /// A client organization calling the API directly
    ApiClient { client_id: String },
}

impl Principal {
    /// Client id this principal bills against
    pub fn client_id(&self) -> &str {
        match self {
            Principal::User { client_id, .. } => client_id,
            Principal::ApiClient { client_id } => client_id,
        }
    }

    /// Identity used as the owner of created transactions
    pub fn owner_id(&self) -> &str {
        match self {
            Principal::User { user_id, .. } => user_id,
            Principal::ApiClient { client_id } => client_id,
        }
    }
}
