//! Wire-level message definitions for the browser-extension protocol.
//!
//! Everything the extension and the bridge exchange is a JSON envelope.
//! The key exchange travels in the clear; every other request carries its
//! real payload as base64 ciphertext in the `message` field. Error codes
//! are an external contract with the extension and must stay stable.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::crypto::{Nonce, Session};
use crate::error::Result;

/// Protocol revision reported in the key-exchange response.
pub const PROTOCOL_VERSION: u32 = 2;

/// Bridge version string reported to the extension.
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum accepted length for URL-like request fields.
pub const MAX_URL_LENGTH: usize = 256;

/// Ordered key/value pairs used to assemble response payloads.
///
/// Insertion order is preserved (`serde_json` with `preserve_order`), which
/// matters for handlers that report results positionally.
pub type Parameters = Map<String, Value>;

/// The outer JSON envelope exchanged on the wire.
///
/// All fields except `action` are optional on input; handlers validate
/// presence themselves so a malformed envelope degrades to an error reply
/// instead of a parse failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    /// Outer action name; for encrypted requests the real action is inside
    /// the ciphertext.
    pub action: String,

    /// Base64 ciphertext of the inner payload; absent for the key exchange.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Client public key; only present in the key exchange.
    #[serde(rename = "publicKey", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// Base64 per-request nonce.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// Client-chosen request correlation ID, echoed in the response.
    #[serde(rename = "requestID")]
    pub request_id: String,

    /// Ask the credential store to open/unlock before handling the request.
    #[serde(rename = "triggerUnlock", skip_serializing_if = "std::ops::Not::not")]
    pub trigger_unlock: bool,
}

/// The set of request kinds the dispatcher understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Unencrypted public-key exchange establishing a session.
    ChangePublicKeys,
    /// Bind the extension's identity to a stored key.
    Associate,
    /// Create or update a credential entry.
    CreateCredentials,
    /// Create a new group (folder) in the database.
    CreateNewGroup,
    /// Delete an entry by UUID.
    DeleteEntry,
    /// Invoke the password-generator UI; result arrives out of band.
    GeneratePassword,
    /// Look up credentials matching a site URL.
    GetCredentials,
    /// List every entry in the database (settings-gated).
    GetDatabaseEntries,
    /// List the database's group tree.
    GetDatabaseGroups,
    /// Report lock/association status per connected database.
    GetDatabaseStatuses,
    /// Compute TOTP codes for a set of entries.
    GetTotp,
    /// Lock the database.
    LockDatabase,
    /// Trigger global autotype for a top-level domain.
    RequestAutotype,
}

impl Action {
    /// The wire name of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ChangePublicKeys => "change-public-keys",
            Action::Associate => "associate",
            Action::CreateCredentials => "create-credentials",
            Action::CreateNewGroup => "create-new-group",
            Action::DeleteEntry => "delete-entry",
            Action::GeneratePassword => "generate-password",
            Action::GetCredentials => "get-credentials",
            Action::GetDatabaseEntries => "get-database-entries",
            Action::GetDatabaseGroups => "get-database-groups",
            Action::GetDatabaseStatuses => "get-database-statuses",
            Action::GetTotp => "get-totp",
            Action::LockDatabase => "lock-database",
            Action::RequestAutotype => "request-autotype",
        }
    }

    /// Parses a wire name; `None` for anything outside the enumerated set.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "change-public-keys" => Some(Action::ChangePublicKeys),
            "associate" => Some(Action::Associate),
            "create-credentials" => Some(Action::CreateCredentials),
            "create-new-group" => Some(Action::CreateNewGroup),
            "delete-entry" => Some(Action::DeleteEntry),
            "generate-password" => Some(Action::GeneratePassword),
            "get-credentials" => Some(Action::GetCredentials),
            "get-database-entries" => Some(Action::GetDatabaseEntries),
            "get-database-groups" => Some(Action::GetDatabaseGroups),
            "get-database-statuses" => Some(Action::GetDatabaseStatuses),
            "get-totp" => Some(Action::GetTotp),
            "lock-database" => Some(Action::LockDatabase),
            "request-autotype" => Some(Action::RequestAutotype),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable numeric error taxonomy shared with the browser extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// The database is closed and could not be opened.
    DatabaseNotOpened = 1,
    /// A request required a database hash that was not supplied.
    DatabaseHashNotReceived = 2,
    /// An encrypted request arrived before the key exchange.
    ClientPublicKeyNotReceived = 3,
    /// The request ciphertext failed to decrypt or authenticate.
    CannotDecryptMessage = 4,
    /// The credential store did not respond in time.
    TimeoutOrNotConnected = 5,
    /// The user cancelled, or the store declined the operation.
    ActionCancelledOrDenied = 6,
    /// Building the encrypted response failed.
    CannotEncryptMessage = 7,
    /// Association with the store failed.
    AssociationFailed = 8,
    /// Replacing session keys failed.
    KeyChangeFailed = 9,
    /// The bridge has no usable key pair.
    EncryptionKeyUnrecognized = 10,
    /// No stored database matches the supplied association keys.
    NoSavedDatabasesFound = 11,
    /// The decrypted action is not in the enumerated set.
    IncorrectAction = 12,
    /// The envelope was empty.
    EmptyMessageReceived = 13,
    /// A URL-bearing request omitted or overflowed its URL.
    NoUrlProvided = 14,
    /// No credentials matched the request.
    NoLoginsFound = 15,
    /// The database has no groups, or listing produced nothing.
    NoGroupsFound = 16,
    /// Group creation failed.
    CannotCreateNewGroup = 17,
    /// A UUID field failed format validation.
    NoValidUuidProvided = 18,
    /// Full-database listing is disallowed by configuration.
    AccessToAllEntriesDenied = 19,
}

impl ErrorCode {
    /// The numeric code sent on the wire.
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// The fixed human-readable message paired with this code.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::DatabaseNotOpened => "Database not opened",
            ErrorCode::DatabaseHashNotReceived => "Database hash not available",
            ErrorCode::ClientPublicKeyNotReceived => "Client public key not received",
            ErrorCode::CannotDecryptMessage => "Cannot decrypt message",
            ErrorCode::TimeoutOrNotConnected => "Timeout or cannot connect to the credential store",
            ErrorCode::ActionCancelledOrDenied => "Action cancelled or denied",
            ErrorCode::CannotEncryptMessage => "Message encryption failed",
            ErrorCode::AssociationFailed => "Association failed, try again",
            ErrorCode::KeyChangeFailed => "Key change was not successful",
            ErrorCode::EncryptionKeyUnrecognized => "Encryption key is not recognized",
            ErrorCode::NoSavedDatabasesFound => "No saved databases found",
            ErrorCode::IncorrectAction => "Incorrect action",
            ErrorCode::EmptyMessageReceived => "Empty message received",
            ErrorCode::NoUrlProvided => "No URL provided",
            ErrorCode::NoLoginsFound => "No logins found",
            ErrorCode::NoGroupsFound => "No groups found",
            ErrorCode::CannotCreateNewGroup => "Cannot create new group",
            ErrorCode::NoValidUuidProvided => "No valid UUID provided",
            ErrorCode::AccessToAllEntriesDenied => "Access to all entries is denied",
        }
    }
}

/// Builds an unencrypted transport-level error reply.
///
/// Used before any session state applies: empty envelopes, missing client
/// keys, undecryptable ciphertext.
pub fn error_reply(action: &str, code: ErrorCode) -> Value {
    json!({
        "action": action,
        "errorCode": code.code(),
        "error": code.message(),
    })
}

/// Builds a fully-formed encrypted response envelope.
///
/// The inner payload carries the bridge version, a `success` marker, the
/// response nonce, and the handler's parameters; it is sealed under
/// `incremented_nonce` and wrapped as `{action, message, nonce, requestID}`.
pub fn build_response(
    session: &Session,
    action: &str,
    incremented_nonce: &Nonce,
    request_id: &str,
    params: Parameters,
) -> Result<Value> {
    let mut inner = Parameters::new();
    inner.insert("version".into(), json!(BRIDGE_VERSION));
    inner.insert("success".into(), json!("true"));
    inner.insert("nonce".into(), json!(incremented_nonce.to_b64()));
    for (key, value) in params {
        inner.insert(key, value);
    }

    let ciphertext = session.encrypt_json(&Value::Object(inner), incremented_nonce)?;
    Ok(json!({
        "action": action,
        "message": ciphertext,
        "nonce": incremented_nonce.to_b64(),
        "requestID": request_id,
    }))
}

/// Builds an action-level error as a normal encrypted response carrying
/// `{errorCode, error}`, indistinguishable on the outside from success.
pub fn build_error_response(
    session: &Session,
    action: &str,
    incremented_nonce: &Nonce,
    request_id: &str,
    code: ErrorCode,
) -> Result<Value> {
    let mut params = Parameters::new();
    params.insert("errorCode".into(), json!(code.code()));
    params.insert("error".into(), json!(code.message()));
    build_response(session, action, incremented_nonce, request_id, params)
}

/// The synthetic notification announcing a (re)connected socket bridge.
pub fn reconnected_notification() -> Value {
    json!({ "action": "reconnected" })
}
