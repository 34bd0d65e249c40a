//! Capability surface of the credential store.
//!
//! The dispatcher never touches credential data directly; everything goes
//! through these traits, injected at construction. The credential-store
//! process implements them over its real database; tests substitute doubles.

use std::sync::{Arc, Mutex};

use protocol::messages::{build_error_response, build_response, ErrorCode, Parameters};
use protocol::{Action, Nonce, Session};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

/// Fields describing a credential entry in a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryParameters {
    /// Username for the entry.
    pub login: String,
    /// Password for the entry.
    pub password: String,
    /// The page URL the request originated from.
    pub site_url: String,
    /// The form submit URL, when different from the page URL.
    pub form_url: String,
    /// HTTP auth realm, when applicable.
    pub realm: String,
    /// Whether the request is for HTTP Basic/Digest auth.
    pub http_auth: bool,
    /// Database hash scoping the lookup.
    pub hash: String,
}

/// One `{id, key}` pair binding an extension identity to a stored key.
///
/// Several handlers resolve authorization against an ordered list of these;
/// order is preserved because results are reported positionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAssociation {
    /// Identifier the store issued when the association was created.
    pub id: String,
    /// The association key material.
    pub key: String,
}

/// Result of creating a group in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupHandle {
    /// Name of the created (or pre-existing) group.
    pub name: String,
    /// UUID of the group.
    pub uuid: String,
}

/// Handle given to the store's password-generator UI.
///
/// The `generate-password` request is acknowledged immediately; the real
/// response is produced here once the user finishes (or cancels) the
/// generator. Fulfilling the prompt releases the pending slot, allowing the
/// next generator request on the connection.
pub struct GeneratorPrompt {
    request_id: String,
    nonce: Nonce,
    session: Session,
    reply: mpsc::Sender<Value>,
    slot: Arc<Mutex<Option<String>>>,
}

impl GeneratorPrompt {
    pub(crate) fn new(
        request_id: String,
        nonce: Nonce,
        session: Session,
        reply: mpsc::Sender<Value>,
        slot: Arc<Mutex<Option<String>>>,
    ) -> Self {
        Self {
            request_id,
            nonce,
            session,
            reply,
            slot,
        }
    }

    /// The request ID this prompt will answer.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Delivers the generated password, or a cancellation error for `None`,
    /// as an encrypted out-of-band response on the originating connection.
    pub fn fulfill(self, password: Option<&str>) {
        let response = match password {
            Some(password) => {
                let mut params = Parameters::new();
                params.insert("password".into(), json!(password));
                build_response(
                    &self.session,
                    Action::GeneratePassword.as_str(),
                    &self.nonce,
                    &self.request_id,
                    params,
                )
            }
            None => build_error_response(
                &self.session,
                Action::GeneratePassword.as_str(),
                &self.nonce,
                &self.request_id,
                ErrorCode::ActionCancelledOrDenied,
            ),
        };

        match response {
            Ok(value) => {
                if self.reply.try_send(value).is_err() {
                    warn!(request_id = %self.request_id, "generator response dropped: connection gone");
                }
            }
            Err(e) => warn!(request_id = %self.request_id, error = %e, "failed to build generator response"),
        }

        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

impl std::fmt::Debug for GeneratorPrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorPrompt")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

/// The credential store's capability interface.
///
/// Boolean or empty results signal "valid but declined"; the dispatcher maps
/// them to error codes or `{result: false}` per its own contract. Calls may
/// block on user interaction (unlock prompt); the dispatcher serializes
/// requests per connection, so a blocked call queues the rest.
pub trait CredentialStore: Send + Sync {
    /// Open (unlock) the database, prompting the user when `trigger_unlock`.
    /// Returns false when the database stays locked.
    fn open_database(&self, trigger_unlock: bool) -> bool;

    /// Hash identifying the currently open database; empty when locked.
    fn database_hash(&self) -> String;

    /// Store a new association key, returning the ID the user confirmed.
    /// `None` when the user cancelled or denied.
    fn store_key(&self, id_key: &str) -> Option<String>;

    /// Whether any of the supplied associations matches the database with
    /// the given hash.
    fn is_database_connected(&self, keys: &[KeyAssociation], hash: &str) -> bool;

    /// Add a brand-new entry.
    fn add_entry(
        &self,
        params: &EntryParameters,
        group: &str,
        group_uuid: &str,
        download_favicon: bool,
    );

    /// Update an existing entry by UUID. Returns false when declined.
    fn update_entry(&self, params: &EntryParameters, uuid: &str) -> bool;

    /// Delete an entry by UUID. Returns false when declined or missing.
    fn delete_entry(&self, uuid: &str) -> bool;

    /// Create a group (path) in the database.
    fn create_new_group(&self, name: &str) -> Option<GroupHandle>;

    /// Find entries matching the request, authorized by the association
    /// list. `None` when nothing matched.
    fn find_entries(&self, params: &EntryParameters, keys: &[KeyAssociation])
        -> Option<Vec<Value>>;

    /// Every entry in the database (settings-gated at the dispatcher).
    fn database_entries(&self) -> Vec<Value>;

    /// The database's group tree as a JSON object.
    fn database_groups(&self) -> Value;

    /// Lock/association status for each connected database, positionally
    /// keyed by the association list.
    fn database_statuses(&self, keys: &[KeyAssociation]) -> Value;

    /// Current TOTP codes for the given entry UUIDs.
    fn totp(&self, keys: &[KeyAssociation], uuids: &[String]) -> Value;

    /// Trigger global autotype for a top-level domain.
    fn request_global_autotype(&self, top_level_domain: &str);

    /// Lock the database.
    fn lock_database(&self);

    /// Show the password-generator UI; the result arrives through `prompt`.
    fn show_password_generator(&self, prompt: GeneratorPrompt);
}

/// Persistent settings gating what the extension may request.
pub trait BridgeSettings: Send + Sync {
    /// Whether `get-database-entries` (full listing) is permitted.
    fn allow_get_database_entries(&self) -> bool;
}
