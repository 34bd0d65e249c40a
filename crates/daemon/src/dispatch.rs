//! Protocol state machine for one extension connection.
//!
//! The dispatcher validates incoming envelopes, performs the unencrypted
//! key exchange, decrypts authenticated requests, routes them to the
//! credential store's capability surface, and builds encrypted responses or
//! structured error replies. One dispatcher exists per socket connection and
//! handles its messages strictly in order, so nonce and session state never
//! see interleaved requests.

use std::sync::{Arc, Mutex};

use protocol::messages::{
    build_error_response, build_response, error_reply, Action, Envelope, ErrorCode, Parameters,
    BRIDGE_VERSION, MAX_URL_LENGTH, PROTOCOL_VERSION,
};
use protocol::{KeyPair, Nonce, Session};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::store::{BridgeSettings, CredentialStore, EntryParameters, GeneratorPrompt, KeyAssociation};

/// A request after decryption, scoped to a single message.
///
/// Never persisted; dropped as soon as the response is built.
#[derive(Debug)]
pub struct DecryptedRequest {
    /// The real action named inside the ciphertext.
    pub action: String,
    /// Correlation ID echoed from the outer envelope.
    pub request_id: String,
    /// Hash of the currently open database at decode time.
    pub hash: String,
    /// The request nonce.
    pub nonce: Nonce,
    /// The response nonce, always `increment(request nonce)`.
    pub incremented_nonce: Nonce,
    decrypted: Value,
}

impl DecryptedRequest {
    fn get_str(&self, key: &str) -> &str {
        self.decrypted.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    fn get_bool(&self, key: &str) -> bool {
        self.decrypted
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or_default()
    }

    fn get_array(&self, key: &str) -> &[Value] {
        self.decrypted
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Per-connection protocol dispatcher.
pub struct ActionDispatcher {
    keys: KeyPair,
    session: Option<Session>,
    store: Arc<dyn CredentialStore>,
    settings: Arc<dyn BridgeSettings>,
    /// Request ID of the outstanding generator request, if any. Shared with
    /// the [`GeneratorPrompt`] handed to the store so fulfillment releases it.
    pending_generator: Arc<Mutex<Option<String>>>,
    /// Outbound channel of the owning connection, used for deferred
    /// generator responses.
    reply: mpsc::Sender<Value>,
}

impl ActionDispatcher {
    /// Creates a dispatcher with a fresh process-lifetime key pair and the
    /// injected collaborators.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        settings: Arc<dyn BridgeSettings>,
        reply: mpsc::Sender<Value>,
    ) -> Self {
        Self {
            keys: KeyPair::generate(),
            session: None,
            store,
            settings,
            pending_generator: Arc::new(Mutex::new(None)),
            reply,
        }
    }

    /// Processes one client envelope.
    ///
    /// Returns the reply to send, or `None` when the response is deferred
    /// (the generate-password acknowledgement).
    pub fn process_client_message(&mut self, message: &Value) -> Option<Value> {
        let non_empty = message.as_object().is_some_and(|o| !o.is_empty());
        if !non_empty {
            return Some(error_reply("", ErrorCode::EmptyMessageReceived));
        }

        let envelope: Envelope = serde_json::from_value(message.clone()).unwrap_or_default();
        debug!(action = %envelope.action, request_id = %envelope.request_id, "client message");

        if envelope.action != Action::ChangePublicKeys.as_str() && self.session.is_none() {
            return Some(error_reply(
                &envelope.action,
                ErrorCode::ClientPublicKeyNotReceived,
            ));
        }

        if envelope.trigger_unlock && !self.store.open_database(true) {
            return Some(error_reply(&envelope.action, ErrorCode::DatabaseNotOpened));
        }

        self.handle_action(&envelope)
    }

    fn handle_action(&mut self, envelope: &Envelope) -> Option<Value> {
        // The key exchange is the one unencrypted request.
        if envelope.action == Action::ChangePublicKeys.as_str() {
            return Some(self.handle_change_public_keys(envelope));
        }

        let request = match self.decode_request(envelope) {
            Some(request) => request,
            None => {
                return Some(error_reply(
                    &envelope.action,
                    ErrorCode::CannotDecryptMessage,
                ))
            }
        };
        debug!(action = %request.action, request_id = %request.request_id, "dispatching");

        let action = match Action::parse(&request.action) {
            Some(action) => action,
            None => return Some(self.respond_error(&request, ErrorCode::IncorrectAction)),
        };

        let response = match action {
            Action::Associate => self.handle_associate(&request),
            Action::CreateCredentials => self.handle_create_credentials(&request),
            Action::CreateNewGroup => self.handle_create_new_group(&request),
            Action::DeleteEntry => self.handle_delete_entry(&request),
            Action::GeneratePassword => return self.handle_generate_password(&request),
            Action::GetCredentials => self.handle_get_credentials(&request),
            Action::GetDatabaseEntries => self.handle_get_database_entries(&request),
            Action::GetDatabaseGroups => self.handle_get_database_groups(&request),
            Action::GetDatabaseStatuses => self.handle_get_database_statuses(&request),
            Action::GetTotp => self.handle_get_totp(&request),
            Action::LockDatabase => self.handle_lock_database(&request),
            Action::RequestAutotype => self.handle_request_autotype(&request),
            // The key exchange is never valid inside the ciphertext.
            Action::ChangePublicKeys => self.respond_error(&request, ErrorCode::IncorrectAction),
        };

        Some(response)
    }

    fn handle_change_public_keys(&mut self, envelope: &Envelope) -> Value {
        let action = Action::ChangePublicKeys.as_str();
        let client_key = envelope.public_key.as_deref().unwrap_or_default();
        let nonce_b64 = envelope.nonce.as_deref().unwrap_or_default();

        if client_key.is_empty() || nonce_b64.is_empty() || envelope.request_id.is_empty() {
            return error_reply(action, ErrorCode::ClientPublicKeyNotReceived);
        }

        let nonce = match Nonce::from_b64(nonce_b64) {
            Ok(nonce) => nonce,
            Err(_) => return error_reply(action, ErrorCode::ClientPublicKeyNotReceived),
        };

        // Replaces any prior session atomically; the old keys are gone once
        // this assignment lands.
        let session = match Session::establish(&self.keys, client_key) {
            Ok(session) => session,
            Err(_) => return error_reply(action, ErrorCode::EncryptionKeyUnrecognized),
        };

        info!(request_id = %envelope.request_id, "session established");
        let response = json!({
            "action": action,
            "nonce": nonce.increment().to_b64(),
            "protocolVersion": PROTOCOL_VERSION,
            "publicKey": session.own_public_key(),
            "requestID": envelope.request_id,
            "version": BRIDGE_VERSION,
        });
        self.session = Some(session);
        response
    }

    fn handle_associate(&self, request: &DecryptedRequest) -> Value {
        let public_key = request.get_str("publicKey");
        let id_key = request.get_str("idKey");

        if public_key.is_empty() || id_key.is_empty() {
            return self.respond_error(request, ErrorCode::AssociationFailed);
        }

        let session_key = self
            .session
            .as_ref()
            .map(Session::client_public_key)
            .unwrap_or_default();
        if public_key != session_key {
            return self.respond_error(request, ErrorCode::AssociationFailed);
        }

        match self.store.store_key(id_key) {
            Some(id) if !id.is_empty() => {
                let mut params = Parameters::new();
                params.insert("hash".into(), json!(request.hash));
                params.insert("id".into(), json!(id));
                self.respond(request, params)
            }
            _ => self.respond_error(request, ErrorCode::ActionCancelledOrDenied),
        }
    }

    fn handle_create_credentials(&self, request: &DecryptedRequest) -> Value {
        if !self.is_database_connected(request) {
            return self.respond_error(request, ErrorCode::AssociationFailed);
        }

        let url = request.get_str("url");
        if url.is_empty() || url.len() > MAX_URL_LENGTH {
            return self.respond_error(request, ErrorCode::NoUrlProvided);
        }

        let uuid = request.get_str("uuid");
        let entry = EntryParameters {
            login: request.get_str("login").to_string(),
            password: request.get_str("password").to_string(),
            site_url: url.to_string(),
            form_url: request.get_str("submitUrl").to_string(),
            ..EntryParameters::default()
        };

        let result = if uuid.is_empty() {
            self.store.add_entry(
                &entry,
                request.get_str("group"),
                request.get_str("groupUuid"),
                request.get_bool("downloadFavicon"),
            );
            true
        } else {
            if !is_valid_uuid(uuid) {
                return self.respond_error(request, ErrorCode::NoValidUuidProvided);
            }
            self.store.update_entry(&entry, uuid)
        };

        let mut params = Parameters::new();
        params.insert("result".into(), json!(result));
        self.respond(request, params)
    }

    fn handle_create_new_group(&self, request: &DecryptedRequest) -> Value {
        if !self.is_database_connected(request) {
            return self.respond_error(request, ErrorCode::AssociationFailed);
        }

        match self.store.create_new_group(request.get_str("groupName")) {
            Some(group) if !group.name.is_empty() && !group.uuid.is_empty() => {
                let mut params = Parameters::new();
                params.insert("name".into(), json!(group.name));
                params.insert("uuid".into(), json!(group.uuid));
                self.respond(request, params)
            }
            _ => self.respond_error(request, ErrorCode::CannotCreateNewGroup),
        }
    }

    fn handle_delete_entry(&self, request: &DecryptedRequest) -> Value {
        if !self.is_database_connected(request) {
            return self.respond_error(request, ErrorCode::AssociationFailed);
        }

        let uuid = request.get_str("uuid");
        if !is_valid_uuid(uuid) {
            return self.respond_error(request, ErrorCode::NoValidUuidProvided);
        }

        let mut params = Parameters::new();
        params.insert("result".into(), json!(self.store.delete_entry(uuid)));
        self.respond(request, params)
    }

    /// Acknowledges with nothing and defers the real response to the
    /// generator UI's completion; only one request may be outstanding.
    fn handle_generate_password(&self, request: &DecryptedRequest) -> Option<Value> {
        {
            let Ok(mut slot) = self.pending_generator.lock() else {
                return Some(self.respond_error(request, ErrorCode::ActionCancelledOrDenied));
            };
            if slot.is_some() {
                return Some(self.respond_error(request, ErrorCode::ActionCancelledOrDenied));
            }
            *slot = Some(request.request_id.clone());
        }

        let Some(session) = self.session.clone() else {
            return Some(error_reply(
                &request.action,
                ErrorCode::ClientPublicKeyNotReceived,
            ));
        };

        let prompt = GeneratorPrompt::new(
            request.request_id.clone(),
            request.incremented_nonce,
            session,
            self.reply.clone(),
            Arc::clone(&self.pending_generator),
        );
        self.store.show_password_generator(prompt);
        None
    }

    fn handle_get_credentials(&self, request: &DecryptedRequest) -> Value {
        let url = request.get_str("url");
        if url.is_empty() || url.len() > MAX_URL_LENGTH {
            return self.respond_error(request, ErrorCode::NoUrlProvided);
        }

        let keys = self.connection_keys(request);
        if keys.is_empty() {
            return self.respond_error(request, ErrorCode::NoSavedDatabasesFound);
        }

        let entry = EntryParameters {
            hash: request.hash.clone(),
            site_url: url.to_string(),
            form_url: request.get_str("submitUrl").to_string(),
            http_auth: request.get_bool("httpAuth"),
            ..EntryParameters::default()
        };

        match self.store.find_entries(&entry, &keys) {
            Some(entries) => {
                let mut params = Parameters::new();
                params.insert("entries".into(), json!(entries));
                params.insert("hash".into(), json!(request.hash));
                self.respond(request, params)
            }
            None => self.respond_error(request, ErrorCode::NoLoginsFound),
        }
    }

    fn handle_get_database_entries(&self, request: &DecryptedRequest) -> Value {
        if !self.is_database_connected(request) {
            return self.respond_error(request, ErrorCode::AssociationFailed);
        }

        if !self.settings.allow_get_database_entries() {
            return self.respond_error(request, ErrorCode::AccessToAllEntriesDenied);
        }

        let entries = self.store.database_entries();
        if entries.is_empty() {
            return self.respond_error(request, ErrorCode::NoGroupsFound);
        }

        let mut params = Parameters::new();
        params.insert("entries".into(), json!(entries));
        self.respond(request, params)
    }

    fn handle_get_database_groups(&self, request: &DecryptedRequest) -> Value {
        if !self.is_database_connected(request) {
            return self.respond_error(request, ErrorCode::AssociationFailed);
        }

        let groups = self.store.database_groups();
        let non_empty = groups.as_object().is_some_and(|o| !o.is_empty());
        if !non_empty {
            return self.respond_error(request, ErrorCode::NoGroupsFound);
        }

        let mut params = Parameters::new();
        params.insert("groups".into(), groups);
        self.respond(request, params)
    }

    fn handle_get_database_statuses(&self, request: &DecryptedRequest) -> Value {
        let keys = self.connection_keys(request);
        let statuses = self.store.database_statuses(&keys);

        let mut params = Parameters::new();
        params.insert("hash".into(), json!(request.hash));
        params.insert("statuses".into(), statuses);
        self.respond(request, params)
    }

    fn handle_get_totp(&self, request: &DecryptedRequest) -> Value {
        let uuids = request.get_array("uuids");
        if uuids.is_empty() {
            return self.respond_error(request, ErrorCode::NoValidUuidProvided);
        }

        let mut uuid_list = Vec::with_capacity(uuids.len());
        for value in uuids {
            let uuid = value.as_str().unwrap_or_default();
            if !is_valid_uuid(uuid) {
                return self.respond_error(request, ErrorCode::NoValidUuidProvided);
            }
            uuid_list.push(uuid.to_string());
        }

        let keys = self.connection_keys(request);
        let mut params = Parameters::new();
        params.insert("totpList".into(), self.store.totp(&keys, &uuid_list));
        self.respond(request, params)
    }

    fn handle_lock_database(&self, request: &DecryptedRequest) -> Value {
        if request.hash.is_empty() {
            return self.respond_error(request, ErrorCode::DatabaseHashNotReceived);
        }

        self.store.lock_database();
        self.respond(request, Parameters::new())
    }

    fn handle_request_autotype(&self, request: &DecryptedRequest) -> Value {
        let top_level_domain = request.get_str("search");
        if top_level_domain.len() > MAX_URL_LENGTH {
            return self.respond_error(request, ErrorCode::NoUrlProvided);
        }

        self.store.request_global_autotype(top_level_domain);
        let mut params = Parameters::new();
        params.insert("result".into(), json!(true));
        self.respond(request, params)
    }

    fn decode_request(&self, envelope: &Envelope) -> Option<DecryptedRequest> {
        let session = self.session.as_ref()?;
        let nonce_b64 = envelope.nonce.as_deref()?;
        let ciphertext = envelope.message.as_deref()?;

        let nonce = Nonce::from_b64(nonce_b64).ok()?;
        let decrypted = session.decrypt_json(ciphertext, nonce_b64).ok()?;
        if !decrypted.as_object().is_some_and(|o| !o.is_empty()) {
            return None;
        }

        let action = decrypted
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Some(DecryptedRequest {
            action,
            request_id: envelope.request_id.clone(),
            hash: self.store.database_hash(),
            nonce,
            incremented_nonce: nonce.increment(),
            decrypted,
        })
    }

    /// Parses `keys: [{id, key}]` into an ordered association list.
    fn connection_keys(&self, request: &DecryptedRequest) -> Vec<KeyAssociation> {
        request
            .get_array("keys")
            .iter()
            .filter_map(Value::as_object)
            .map(|key| KeyAssociation {
                id: key.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                key: key
                    .get("key")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect()
    }

    fn is_database_connected(&self, request: &DecryptedRequest) -> bool {
        let keys = self.connection_keys(request);
        self.store.is_database_connected(&keys, request.get_str("hash"))
    }

    fn respond(&self, request: &DecryptedRequest, params: Parameters) -> Value {
        let Some(session) = self.session.as_ref() else {
            return error_reply(&request.action, ErrorCode::ClientPublicKeyNotReceived);
        };
        build_response(
            session,
            &request.action,
            &request.incremented_nonce,
            &request.request_id,
            params,
        )
        .unwrap_or_else(|_| error_reply(&request.action, ErrorCode::CannotEncryptMessage))
    }

    fn respond_error(&self, request: &DecryptedRequest, code: ErrorCode) -> Value {
        let Some(session) = self.session.as_ref() else {
            return error_reply(&request.action, ErrorCode::ClientPublicKeyNotReceived);
        };
        build_error_response(
            session,
            &request.action,
            &request.incremented_nonce,
            &request.request_id,
            code,
        )
        .unwrap_or_else(|_| error_reply(&request.action, ErrorCode::CannotEncryptMessage))
    }
}

/// Accepts RFC 4122 text forms and the extension's 32-hex-digit form.
fn is_valid_uuid(value: &str) -> bool {
    uuid::Uuid::parse_str(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::GroupHandle;
    use std::sync::Mutex as StdMutex;

    /// Configurable in-memory credential store double.
    struct MockStore {
        state: StdMutex<MockState>,
        prompt: StdMutex<Option<GeneratorPrompt>>,
    }

    struct MockState {
        unlock_succeeds: bool,
        stored_key_id: Option<String>,
        connected: bool,
        hash: String,
        update_result: bool,
        delete_result: bool,
        group: Option<GroupHandle>,
        found_entries: Option<Vec<Value>>,
        entries: Vec<Value>,
        groups: Value,
        statuses: Value,
        totp: Value,
        open_calls: usize,
        add_calls: usize,
        generator_calls: usize,
        autotype: Vec<String>,
        lock_calls: usize,
        last_keys: Vec<KeyAssociation>,
    }

    impl Default for MockState {
        fn default() -> Self {
            Self {
                unlock_succeeds: true,
                stored_key_id: Some("browser-firefox".to_string()),
                connected: true,
                hash: "29234e32274a32276e25666a42".to_string(),
                update_result: true,
                delete_result: true,
                group: Some(GroupHandle {
                    name: "logins".to_string(),
                    uuid: "2a5a1a0c6b1e4746b318c70f21c66e4b".to_string(),
                }),
                found_entries: Some(vec![json!({"login": "user", "password": "pw"})]),
                entries: vec![json!({"title": "example"})],
                groups: json!({"groups": [{"name": "Root", "children": []}]}),
                statuses: json!([{"locked": false}]),
                totp: json!([{"totp": "123456"}]),
                open_calls: 0,
                add_calls: 0,
                generator_calls: 0,
                autotype: Vec::new(),
                lock_calls: 0,
                last_keys: Vec::new(),
            }
        }
    }

    impl MockStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                state: StdMutex::new(MockState::default()),
                prompt: StdMutex::new(None),
            })
        }

        fn configure(&self, f: impl FnOnce(&mut MockState)) {
            f(&mut self.state.lock().unwrap());
        }

        fn state(&self, f: impl FnOnce(&MockState) -> usize) -> usize {
            f(&self.state.lock().unwrap())
        }

        fn take_prompt(&self) -> Option<GeneratorPrompt> {
            self.prompt.lock().unwrap().take()
        }
    }

    impl CredentialStore for MockStore {
        fn open_database(&self, _trigger_unlock: bool) -> bool {
            let mut state = self.state.lock().unwrap();
            state.open_calls += 1;
            state.unlock_succeeds
        }

        fn database_hash(&self) -> String {
            self.state.lock().unwrap().hash.clone()
        }

        fn store_key(&self, _id_key: &str) -> Option<String> {
            self.state.lock().unwrap().stored_key_id.clone()
        }

        fn is_database_connected(&self, keys: &[KeyAssociation], _hash: &str) -> bool {
            let mut state = self.state.lock().unwrap();
            state.last_keys = keys.to_vec();
            state.connected
        }

        fn add_entry(
            &self,
            _params: &EntryParameters,
            _group: &str,
            _group_uuid: &str,
            _download_favicon: bool,
        ) {
            self.state.lock().unwrap().add_calls += 1;
        }

        fn update_entry(&self, _params: &EntryParameters, _uuid: &str) -> bool {
            self.state.lock().unwrap().update_result
        }

        fn delete_entry(&self, _uuid: &str) -> bool {
            self.state.lock().unwrap().delete_result
        }

        fn create_new_group(&self, _name: &str) -> Option<GroupHandle> {
            self.state.lock().unwrap().group.clone()
        }

        fn find_entries(
            &self,
            _params: &EntryParameters,
            keys: &[KeyAssociation],
        ) -> Option<Vec<Value>> {
            let mut state = self.state.lock().unwrap();
            state.last_keys = keys.to_vec();
            state.found_entries.clone()
        }

        fn database_entries(&self) -> Vec<Value> {
            self.state.lock().unwrap().entries.clone()
        }

        fn database_groups(&self) -> Value {
            self.state.lock().unwrap().groups.clone()
        }

        fn database_statuses(&self, keys: &[KeyAssociation]) -> Value {
            let mut state = self.state.lock().unwrap();
            state.last_keys = keys.to_vec();
            state.statuses.clone()
        }

        fn totp(&self, _keys: &[KeyAssociation], _uuids: &[String]) -> Value {
            self.state.lock().unwrap().totp.clone()
        }

        fn request_global_autotype(&self, top_level_domain: &str) {
            self.state
                .lock()
                .unwrap()
                .autotype
                .push(top_level_domain.to_string());
        }

        fn lock_database(&self) {
            self.state.lock().unwrap().lock_calls += 1;
        }

        fn show_password_generator(&self, prompt: GeneratorPrompt) {
            self.state.lock().unwrap().generator_calls += 1;
            *self.prompt.lock().unwrap() = Some(prompt);
        }
    }

    struct MockSettings {
        allow_entries: bool,
    }

    impl BridgeSettings for MockSettings {
        fn allow_get_database_entries(&self) -> bool {
            self.allow_entries
        }
    }

    /// Extension-side half of the protocol, for driving the dispatcher.
    struct TestClient {
        keys: KeyPair,
        session: Option<Session>,
    }

    impl TestClient {
        fn new() -> Self {
            Self {
                keys: KeyPair::generate(),
                session: None,
            }
        }

        fn handshake(&mut self, dispatcher: &mut ActionDispatcher) -> Value {
            let nonce = Nonce::generate();
            let response = dispatcher
                .process_client_message(&json!({
                    "action": "change-public-keys",
                    "nonce": nonce.to_b64(),
                    "publicKey": self.keys.public_key_b64(),
                    "requestID": "handshake-1",
                }))
                .expect("handshake always yields a reply");

            if let Some(bridge_key) = response.get("publicKey").and_then(Value::as_str) {
                self.session = Some(Session::establish(&self.keys, bridge_key).unwrap());
            }
            response
        }

        fn send(
            &self,
            dispatcher: &mut ActionDispatcher,
            request_id: &str,
            inner: Value,
        ) -> Option<Value> {
            let nonce = Nonce::generate();
            let session = self.session.as_ref().expect("handshake first");
            let message = session.encrypt_json(&inner, &nonce).unwrap();
            dispatcher.process_client_message(&json!({
                "action": inner["action"],
                "message": message,
                "nonce": nonce.to_b64(),
                "requestID": request_id,
            }))
        }

        fn open(&self, response: &Value) -> Value {
            let session = self.session.as_ref().unwrap();
            session
                .decrypt_json(
                    response["message"].as_str().expect("encrypted response"),
                    response["nonce"].as_str().unwrap(),
                )
                .unwrap()
        }
    }

    fn dispatcher_with(
        store: Arc<MockStore>,
        allow_entries: bool,
    ) -> (ActionDispatcher, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(8);
        let settings = Arc::new(MockSettings { allow_entries });
        (ActionDispatcher::new(store, settings, tx), rx)
    }

    fn ready() -> (ActionDispatcher, TestClient, Arc<MockStore>, mpsc::Receiver<Value>) {
        let store = MockStore::new();
        let (mut dispatcher, rx) = dispatcher_with(Arc::clone(&store), true);
        let mut client = TestClient::new();
        client.handshake(&mut dispatcher);
        (dispatcher, client, store, rx)
    }

    const VALID_UUID: &str = "e2b1f4a09c8d4f6e8a7b3c2d1e0f9a8b";

    #[test]
    fn test_empty_message_rejected() {
        let store = MockStore::new();
        let (mut dispatcher, _rx) = dispatcher_with(store, true);

        let response = dispatcher.process_client_message(&json!({})).unwrap();
        assert_eq!(response["errorCode"], json!(13));

        let response = dispatcher.process_client_message(&Value::Null).unwrap();
        assert_eq!(response["errorCode"], json!(13));
    }

    #[test]
    fn test_actions_rejected_before_handshake() {
        let store = MockStore::new();
        let (mut dispatcher, _rx) = dispatcher_with(store, true);

        let response = dispatcher
            .process_client_message(&json!({
                "action": "get-totp",
                "message": "abcd",
                "nonce": Nonce::generate().to_b64(),
                "requestID": "r1",
            }))
            .unwrap();
        assert_eq!(response["errorCode"], json!(3));
        assert_eq!(response["action"], json!("get-totp"));
    }

    #[test]
    fn test_handshake_response_shape() {
        let store = MockStore::new();
        let (mut dispatcher, _rx) = dispatcher_with(store, true);
        let mut client = TestClient::new();

        let nonce = Nonce::generate();
        let response = dispatcher
            .process_client_message(&json!({
                "action": "change-public-keys",
                "nonce": nonce.to_b64(),
                "publicKey": client.keys.public_key_b64(),
                "requestID": "hs",
            }))
            .unwrap();

        assert_eq!(response["action"], json!("change-public-keys"));
        assert_eq!(response["protocolVersion"], json!(2));
        assert_eq!(response["requestID"], json!("hs"));
        assert_eq!(response["nonce"], json!(nonce.increment().to_b64()));
        assert!(response["publicKey"].as_str().is_some_and(|k| !k.is_empty()));
        assert!(response.get("errorCode").is_none());

        // The returned key is usable for a client-side session.
        client.session = Some(
            Session::establish(&client.keys, response["publicKey"].as_str().unwrap()).unwrap(),
        );
    }

    #[test]
    fn test_handshake_missing_fields_rejected() {
        let store = MockStore::new();
        let (mut dispatcher, _rx) = dispatcher_with(store, true);

        for body in [
            json!({"action": "change-public-keys", "nonce": Nonce::generate().to_b64(), "requestID": "r"}),
            json!({"action": "change-public-keys", "publicKey": "abc", "requestID": "r"}),
            json!({"action": "change-public-keys", "publicKey": "abc", "nonce": Nonce::generate().to_b64()}),
        ] {
            let response = dispatcher.process_client_message(&body).unwrap();
            assert_eq!(response["errorCode"], json!(3), "body: {body}");
        }
    }

    #[test]
    fn test_handshake_invalid_peer_key_rejected() {
        let store = MockStore::new();
        let (mut dispatcher, _rx) = dispatcher_with(store, true);

        let response = dispatcher
            .process_client_message(&json!({
                "action": "change-public-keys",
                "nonce": Nonce::generate().to_b64(),
                "publicKey": "@@@not base64@@@",
                "requestID": "hs",
            }))
            .unwrap();
        assert_eq!(response["errorCode"], json!(10));
    }

    #[test]
    fn test_undecryptable_message_degrades_to_error() {
        let (mut dispatcher, _client, _store, _rx) = ready();

        let response = dispatcher
            .process_client_message(&json!({
                "action": "get-totp",
                "message": "bm90IGEgY2lwaGVydGV4dA==",
                "nonce": Nonce::generate().to_b64(),
                "requestID": "r1",
            }))
            .unwrap();
        assert_eq!(response["errorCode"], json!(4));
    }

    #[test]
    fn test_unknown_inner_action_yields_incorrect_action() {
        let (mut dispatcher, client, _store, _rx) = ready();

        let response = client
            .send(&mut dispatcher, "r1", json!({"action": "steal-everything"}))
            .unwrap();
        let inner = client.open(&response);
        assert_eq!(inner["errorCode"], json!(12));
    }

    #[test]
    fn test_inner_change_public_keys_is_incorrect_action() {
        let (mut dispatcher, client, _store, _rx) = ready();

        // Smuggled under an ordinary outer action so the ciphertext is
        // actually opened; a key exchange never rides inside a session.
        let nonce = Nonce::generate();
        let session = client.session.as_ref().unwrap();
        let message = session
            .encrypt_json(&json!({"action": "change-public-keys"}), &nonce)
            .unwrap();
        let response = dispatcher
            .process_client_message(&json!({
                "action": "get-totp",
                "message": message,
                "nonce": nonce.to_b64(),
                "requestID": "r1",
            }))
            .unwrap();
        let inner = client.open(&response);
        assert_eq!(inner["errorCode"], json!(12));
    }

    #[test]
    fn test_response_nonce_is_incremented_request_nonce() {
        let (mut dispatcher, client, _store, _rx) = ready();

        let nonce = Nonce::generate();
        let session = client.session.as_ref().unwrap();
        let message = session
            .encrypt_json(&json!({"action": "get-database-statuses"}), &nonce)
            .unwrap();
        let response = dispatcher
            .process_client_message(&json!({
                "action": "get-database-statuses",
                "message": message,
                "nonce": nonce.to_b64(),
                "requestID": "r1",
            }))
            .unwrap();

        assert_eq!(response["nonce"], json!(nonce.increment().to_b64()));
        assert_ne!(response["nonce"], json!(nonce.to_b64()));
    }

    #[test]
    fn test_associate_success() {
        let (mut dispatcher, client, _store, _rx) = ready();

        let response = client
            .send(
                &mut dispatcher,
                "r1",
                json!({
                    "action": "associate",
                    "publicKey": client.keys.public_key_b64(),
                    "idKey": "aWRrZXk=",
                }),
            )
            .unwrap();
        let inner = client.open(&response);
        assert_eq!(inner["id"], json!("browser-firefox"));
        assert_eq!(inner["hash"], json!("29234e32274a32276e25666a42"));
        assert!(inner.get("errorCode").is_none());
    }

    #[test]
    fn test_associate_with_foreign_key_fails() {
        let (mut dispatcher, client, _store, _rx) = ready();

        let stranger = KeyPair::generate();
        let response = client
            .send(
                &mut dispatcher,
                "r1",
                json!({
                    "action": "associate",
                    "publicKey": stranger.public_key_b64(),
                    "idKey": "aWRrZXk=",
                }),
            )
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(8));
    }

    #[test]
    fn test_associate_denied_by_user() {
        let (mut dispatcher, client, store, _rx) = ready();
        store.configure(|s| s.stored_key_id = None);

        let response = client
            .send(
                &mut dispatcher,
                "r1",
                json!({
                    "action": "associate",
                    "publicKey": client.keys.public_key_b64(),
                    "idKey": "aWRrZXk=",
                }),
            )
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(6));
    }

    #[test]
    fn test_delete_entry_invalid_uuid() {
        let (mut dispatcher, client, _store, _rx) = ready();

        let response = client
            .send(
                &mut dispatcher,
                "r1",
                json!({"action": "delete-entry", "uuid": "not-a-uuid"}),
            )
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(18));
    }

    #[test]
    fn test_delete_entry_success() {
        let (mut dispatcher, client, _store, _rx) = ready();

        let response = client
            .send(
                &mut dispatcher,
                "r1",
                json!({"action": "delete-entry", "uuid": VALID_UUID}),
            )
            .unwrap();
        assert_eq!(client.open(&response)["result"], json!(true));
    }

    #[test]
    fn test_delete_entry_declined_is_result_false() {
        let (mut dispatcher, client, store, _rx) = ready();
        store.configure(|s| s.delete_result = false);

        let response = client
            .send(
                &mut dispatcher,
                "r1",
                json!({"action": "delete-entry", "uuid": VALID_UUID}),
            )
            .unwrap();
        let inner = client.open(&response);
        assert_eq!(inner["result"], json!(false));
        assert!(inner.get("errorCode").is_none());
    }

    #[test]
    fn test_get_totp_rejects_bad_uuid_list() {
        let (mut dispatcher, client, _store, _rx) = ready();

        for uuids in [json!([]), json!(["nope"]), json!([VALID_UUID, "nope"])] {
            let response = client
                .send(&mut dispatcher, "r1", json!({"action": "get-totp", "uuids": uuids}))
                .unwrap();
            assert_eq!(client.open(&response)["errorCode"], json!(18));
        }
    }

    #[test]
    fn test_get_totp_success() {
        let (mut dispatcher, client, _store, _rx) = ready();

        let response = client
            .send(
                &mut dispatcher,
                "r1",
                json!({"action": "get-totp", "uuids": [VALID_UUID]}),
            )
            .unwrap();
        assert_eq!(client.open(&response)["totpList"], json!([{"totp": "123456"}]));
    }

    #[test]
    fn test_get_credentials_requires_url_and_keys() {
        let (mut dispatcher, client, _store, _rx) = ready();

        let response = client
            .send(&mut dispatcher, "r1", json!({"action": "get-credentials"}))
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(14));

        let long_url = format!("https://{}.com", "a".repeat(MAX_URL_LENGTH));
        let response = client
            .send(
                &mut dispatcher,
                "r2",
                json!({"action": "get-credentials", "url": long_url}),
            )
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(14));

        let response = client
            .send(
                &mut dispatcher,
                "r3",
                json!({"action": "get-credentials", "url": "https://example.com"}),
            )
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(11));
    }

    #[test]
    fn test_get_credentials_no_logins_found() {
        let (mut dispatcher, client, store, _rx) = ready();
        store.configure(|s| s.found_entries = None);

        let response = client
            .send(
                &mut dispatcher,
                "r1",
                json!({
                    "action": "get-credentials",
                    "url": "https://example.com",
                    "keys": [{"id": "a", "key": "k"}],
                }),
            )
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(15));
    }

    #[test]
    fn test_get_credentials_success_preserves_key_order() {
        let (mut dispatcher, client, store, _rx) = ready();

        let response = client
            .send(
                &mut dispatcher,
                "r1",
                json!({
                    "action": "get-credentials",
                    "url": "https://example.com",
                    "keys": [
                        {"id": "second-db", "key": "k2"},
                        {"id": "first-db", "key": "k1"},
                    ],
                }),
            )
            .unwrap();
        let inner = client.open(&response);
        assert_eq!(inner["entries"], json!([{"login": "user", "password": "pw"}]));
        assert_eq!(inner["hash"], json!("29234e32274a32276e25666a42"));

        let state = store.state.lock().unwrap();
        let ids: Vec<&str> = state.last_keys.iter().map(|k| k.id.as_str()).collect();
        assert_eq!(ids, ["second-db", "first-db"]);
    }

    #[test]
    fn test_create_credentials_paths() {
        let (mut dispatcher, client, store, _rx) = ready();

        // Missing URL
        let response = client
            .send(&mut dispatcher, "r1", json!({"action": "create-credentials"}))
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(14));

        // New entry
        let response = client
            .send(
                &mut dispatcher,
                "r2",
                json!({
                    "action": "create-credentials",
                    "url": "https://example.com",
                    "login": "user",
                    "password": "pw",
                }),
            )
            .unwrap();
        assert_eq!(client.open(&response)["result"], json!(true));
        assert_eq!(store.state(|s| s.add_calls), 1);

        // Update with a bad uuid
        let response = client
            .send(
                &mut dispatcher,
                "r3",
                json!({
                    "action": "create-credentials",
                    "url": "https://example.com",
                    "uuid": "zzz",
                }),
            )
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(18));

        // Update declined
        store.configure(|s| s.update_result = false);
        let response = client
            .send(
                &mut dispatcher,
                "r4",
                json!({
                    "action": "create-credentials",
                    "url": "https://example.com",
                    "uuid": VALID_UUID,
                }),
            )
            .unwrap();
        assert_eq!(client.open(&response)["result"], json!(false));
    }

    #[test]
    fn test_create_credentials_requires_association() {
        let (mut dispatcher, client, store, _rx) = ready();
        store.configure(|s| s.connected = false);

        let response = client
            .send(
                &mut dispatcher,
                "r1",
                json!({"action": "create-credentials", "url": "https://example.com"}),
            )
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(8));
    }

    #[test]
    fn test_create_new_group() {
        let (mut dispatcher, client, store, _rx) = ready();

        let response = client
            .send(
                &mut dispatcher,
                "r1",
                json!({"action": "create-new-group", "groupName": "logins"}),
            )
            .unwrap();
        let inner = client.open(&response);
        assert_eq!(inner["name"], json!("logins"));
        assert!(inner["uuid"].as_str().is_some_and(|u| !u.is_empty()));

        store.configure(|s| s.group = None);
        let response = client
            .send(
                &mut dispatcher,
                "r2",
                json!({"action": "create-new-group", "groupName": "logins"}),
            )
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(17));
    }

    #[test]
    fn test_get_database_entries_settings_gate() {
        let store = MockStore::new();
        let (mut dispatcher, _rx) = dispatcher_with(Arc::clone(&store), false);
        let mut client = TestClient::new();
        client.handshake(&mut dispatcher);

        let response = client
            .send(&mut dispatcher, "r1", json!({"action": "get-database-entries"}))
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(19));
    }

    #[test]
    fn test_get_database_entries_success_and_empty() {
        let (mut dispatcher, client, store, _rx) = ready();

        let response = client
            .send(&mut dispatcher, "r1", json!({"action": "get-database-entries"}))
            .unwrap();
        assert_eq!(client.open(&response)["entries"], json!([{"title": "example"}]));

        store.configure(|s| s.entries = Vec::new());
        let response = client
            .send(&mut dispatcher, "r2", json!({"action": "get-database-entries"}))
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(16));
    }

    #[test]
    fn test_get_database_groups() {
        let (mut dispatcher, client, store, _rx) = ready();

        let response = client
            .send(&mut dispatcher, "r1", json!({"action": "get-database-groups"}))
            .unwrap();
        let inner = client.open(&response);
        assert_eq!(inner["groups"]["groups"][0]["name"], json!("Root"));

        store.configure(|s| s.groups = json!({}));
        let response = client
            .send(&mut dispatcher, "r2", json!({"action": "get-database-groups"}))
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(16));
    }

    #[test]
    fn test_get_database_statuses() {
        let (mut dispatcher, client, _store, _rx) = ready();

        let response = client
            .send(
                &mut dispatcher,
                "r1",
                json!({
                    "action": "get-database-statuses",
                    "keys": [{"id": "a", "key": "k"}],
                }),
            )
            .unwrap();
        let inner = client.open(&response);
        assert_eq!(inner["statuses"], json!([{"locked": false}]));
        assert_eq!(inner["hash"], json!("29234e32274a32276e25666a42"));
    }

    #[test]
    fn test_lock_database() {
        let (mut dispatcher, client, store, _rx) = ready();

        let response = client
            .send(&mut dispatcher, "r1", json!({"action": "lock-database"}))
            .unwrap();
        let inner = client.open(&response);
        assert_eq!(inner["success"], json!("true"));
        assert_eq!(store.state(|s| s.lock_calls), 1);

        store.configure(|s| s.hash = String::new());
        let response = client
            .send(&mut dispatcher, "r2", json!({"action": "lock-database"}))
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(2));
    }

    #[test]
    fn test_request_autotype() {
        let (mut dispatcher, client, store, _rx) = ready();

        let response = client
            .send(
                &mut dispatcher,
                "r1",
                json!({"action": "request-autotype", "search": "example.com"}),
            )
            .unwrap();
        assert_eq!(client.open(&response)["result"], json!(true));
        assert_eq!(store.state.lock().unwrap().autotype, ["example.com"]);

        let response = client
            .send(
                &mut dispatcher,
                "r2",
                json!({"action": "request-autotype", "search": "a".repeat(MAX_URL_LENGTH + 1)}),
            )
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(14));
    }

    #[test]
    fn test_trigger_unlock_failure_stops_request() {
        let (mut dispatcher, client, store, _rx) = ready();
        store.configure(|s| s.unlock_succeeds = false);

        let nonce = Nonce::generate();
        let session = client.session.as_ref().unwrap();
        let message = session
            .encrypt_json(&json!({"action": "get-database-statuses"}), &nonce)
            .unwrap();
        let response = dispatcher
            .process_client_message(&json!({
                "action": "get-database-statuses",
                "message": message,
                "nonce": nonce.to_b64(),
                "requestID": "r1",
                "triggerUnlock": true,
            }))
            .unwrap();
        assert_eq!(response["errorCode"], json!(1));
        assert_eq!(store.state(|s| s.open_calls), 1);
    }

    #[test]
    fn test_generate_password_defers_and_guards() {
        let (mut dispatcher, client, store, mut rx) = ready();

        // First request: acknowledged with nothing, collaborator invoked.
        let ack = client.send(&mut dispatcher, "gen-1", json!({"action": "generate-password"}));
        assert!(ack.is_none());
        assert_eq!(store.state(|s| s.generator_calls), 1);

        // Second request while pending: rejected without a second invocation.
        let response = client
            .send(&mut dispatcher, "gen-2", json!({"action": "generate-password"}))
            .unwrap();
        assert_eq!(client.open(&response)["errorCode"], json!(6));
        assert_eq!(store.state(|s| s.generator_calls), 1);

        // UI completion fulfills the slot out of band.
        let prompt = store.take_prompt().unwrap();
        assert_eq!(prompt.request_id(), "gen-1");
        prompt.fulfill(Some("correct horse battery staple"));

        let deferred = rx.try_recv().unwrap();
        assert_eq!(deferred["action"], json!("generate-password"));
        assert_eq!(deferred["requestID"], json!("gen-1"));
        let inner = client.open(&deferred);
        assert_eq!(inner["password"], json!("correct horse battery staple"));

        // Slot released: a new request goes through again.
        let ack = client.send(&mut dispatcher, "gen-3", json!({"action": "generate-password"}));
        assert!(ack.is_none());
        assert_eq!(store.state(|s| s.generator_calls), 2);
    }

    #[test]
    fn test_generate_password_cancel_fulfills_with_error() {
        let (mut dispatcher, client, store, mut rx) = ready();

        let ack = client.send(&mut dispatcher, "gen-1", json!({"action": "generate-password"}));
        assert!(ack.is_none());

        store.take_prompt().unwrap().fulfill(None);
        let deferred = rx.try_recv().unwrap();
        assert_eq!(client.open(&deferred)["errorCode"], json!(6));
    }

    #[test]
    fn test_new_handshake_replaces_session() {
        let (mut dispatcher, mut old_client, _store, _rx) = ready();

        let mut new_client = TestClient::new();
        new_client.handshake(&mut dispatcher);

        // The new session works.
        let response = new_client
            .send(&mut dispatcher, "r1", json!({"action": "get-database-statuses"}))
            .unwrap();
        assert!(response.get("message").is_some());

        // The old session's ciphertexts no longer authenticate.
        let response = old_client
            .send(&mut dispatcher, "r2", json!({"action": "get-database-statuses"}))
            .unwrap();
        assert_eq!(response["errorCode"], json!(4));

        // Re-handshake restores the old client.
        old_client.handshake(&mut dispatcher);
        let response = old_client
            .send(&mut dispatcher, "r3", json!({"action": "get-database-statuses"}))
            .unwrap();
        assert!(response.get("message").is_some());
    }

    #[test]
    fn test_uuid_validation() {
        assert!(is_valid_uuid(VALID_UUID));
        assert!(is_valid_uuid("e2b1f4a0-9c8d-4f6e-8a7b-3c2d1e0f9a8b"));
        assert!(!is_valid_uuid("not-a-uuid"));
        assert!(!is_valid_uuid(""));
        assert!(!is_valid_uuid("e2b1f4a09c8d4f6e8a7b3c2d1e0f9a8"));
    }
}
