//! Matrix client adapter (4.E): the only part of the bridge that speaks HTTP
//! to the homeserver. `MatrixApi` is the seam room/bridge/queue code programs
//! against; `MatrixClient` is the `reqwest`-backed implementation, and
//! `test_support` (cfg(test)) provides an in-memory fake for unit tests.

use crate::error::MatrixError;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::types::*;

const MAX_RETRIES: u32 = 60;
const RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// The HTTP surface the rest of the bridge drives the homeserver through.
/// One implementation talks to a real homeserver; tests use a recording fake.
#[async_trait]
pub trait MatrixApi: Send + Sync {
    async fn whoami(&self) -> Result<WhoAmI, MatrixError>;
    async fn joined_rooms(&self) -> Result<JoinedRooms, MatrixError>;
    async fn joined_members(&self, room_id: &str) -> Result<JoinedMembers, MatrixError>;

    async fn get_account_data(&self, user_id: &str, key: &str) -> Result<Value, MatrixError>;
    async fn put_account_data(&self, user_id: &str, key: &str, value: &Value) -> Result<(), MatrixError>;
    async fn get_room_account_data(&self, user_id: &str, room_id: &str, key: &str) -> Result<Value, MatrixError>;
    async fn put_room_account_data(
        &self,
        user_id: &str,
        room_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), MatrixError>;

    async fn get_state_event(&self, room_id: &str, event_type: &str, state_key: &str) -> Result<Value, MatrixError>;
    async fn send_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
        user_id: Option<&str>,
    ) -> Result<(), MatrixError>;
    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
        user_id: Option<&str>,
    ) -> Result<SendEventResponse, MatrixError>;

    async fn create_room(&self, req: &CreateRoomRequest, user_id: Option<&str>) -> Result<CreateRoomResponse, MatrixError>;
    async fn invite(&self, room_id: &str, user_id: &str, as_user: Option<&str>) -> Result<(), MatrixError>;
    async fn join_room(&self, room_id_or_alias: &str, user_id: Option<&str>) -> Result<(), MatrixError>;
    async fn leave_room(&self, room_id: &str, user_id: Option<&str>) -> Result<(), MatrixError>;
    async fn kick(&self, room_id: &str, user_id: &str, reason: Option<&str>) -> Result<(), MatrixError>;
    async fn forget_room(&self, room_id: &str, user_id: Option<&str>) -> Result<(), MatrixError>;

    async fn register_user(&self, localpart: &str) -> Result<RegisterResponse, MatrixError>;
    async fn set_displayname(&self, user_id: &str, name: &str) -> Result<(), MatrixError>;
    async fn set_avatar_url(&self, user_id: &str, mxc: &str) -> Result<(), MatrixError>;
    async fn upload_media(&self, bytes: Vec<u8>, content_type: &str, filename: &str) -> Result<String, MatrixError>;

    async fn synapse_admin_is_admin(&self, user_id: &str) -> Result<bool, MatrixError>;
    async fn synapse_admin_join(&self, room_id_or_alias: &str, user_id: &str) -> Result<(), MatrixError>;
}

/// `reqwest`-backed `MatrixApi`. Every request carries `as_token` as a bearer
/// token and, for puppeted calls, a `user_id` query parameter (the appservice
/// masquerade mechanism); transport failures retry with a fixed backoff, but
/// any response the homeserver actually answered (4xx/5xx with an errcode) is
/// surfaced immediately rather than retried.
pub struct MatrixClient {
    http: reqwest::Client,
    homeserver: String,
    as_token: String,
    sender_localpart: String,
    txn_epoch: u64,
    txn_seq: AtomicU64,
}

impl MatrixClient {
    pub fn new(homeserver: impl Into<String>, as_token: impl Into<String>, sender_localpart: impl Into<String>) -> Self {
        MatrixClient {
            http: reqwest::Client::new(),
            homeserver: homeserver.into(),
            as_token: as_token.into(),
            sender_localpart: sender_localpart.into(),
            txn_epoch: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            txn_seq: AtomicU64::new(0),
        }
    }

    fn next_txn_id(&self) -> u64 {
        self.txn_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn url(&self, path: &str, user_id: Option<&str>) -> String {
        let sep = if path.contains('?') { '&' } else { '?' };
        match user_id {
            Some(uid) => format!(
                "{}{path}{sep}user_id={}",
                self.homeserver,
                percent_encoding::utf8_percent_encode(uid, percent_encoding::NON_ALPHANUMERIC)
            ),
            None => format!("{}{path}", self.homeserver),
        }
    }

    /// Sends one request, retrying transport errors up to `MAX_RETRIES` times
    /// with a fixed backoff (6): a homeserver that is merely slow or briefly
    /// unreachable must not drop bridge traffic.
    async fn request(&self, method: Method, path: &str, user_id: Option<&str>, body: Option<&Value>) -> Result<Value, MatrixError> {
        let url = self.url(path, user_id);
        let mut attempt = 0;
        loop {
            let mut req = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.as_token);
            if let Some(body) = body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return if status == StatusCode::NO_CONTENT {
                            Ok(Value::Null)
                        } else {
                            resp.json::<Value>().await.map_err(MatrixError::from)
                        };
                    }
                    let status_code = status.as_u16();
                    let body: Value = resp.json().await.unwrap_or(Value::Null);
                    let errcode = body.get("errcode").and_then(Value::as_str).unwrap_or("M_UNKNOWN");
                    let message = body.get("error").and_then(Value::as_str).unwrap_or("");
                    return Err(MatrixError::from_response(status_code, errcode, message));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        return Err(MatrixError::from(e));
                    }
                    warn!("matrix request to {path} failed ({e}), retrying ({attempt}/{MAX_RETRIES})");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }
}

#[async_trait]
impl MatrixApi for MatrixClient {
    async fn whoami(&self) -> Result<WhoAmI, MatrixError> {
        let v = self.request(Method::GET, "/_matrix/client/v3/account/whoami", None, None).await?;
        serde_json::from_value(v).map_err(|e| MatrixError::Other {
            status: 0,
            errcode: "M_BAD_JSON".to_string(),
            message: e.to_string(),
        })
    }

    async fn joined_rooms(&self) -> Result<JoinedRooms, MatrixError> {
        let v = self.request(Method::GET, "/_matrix/client/v3/joined_rooms", None, None).await?;
        serde_json::from_value(v).map_err(|e| MatrixError::Other {
            status: 0,
            errcode: "M_BAD_JSON".to_string(),
            message: e.to_string(),
        })
    }

    async fn joined_members(&self, room_id: &str) -> Result<JoinedMembers, MatrixError> {
        let path = format!("/_matrix/client/v3/rooms/{room_id}/joined_members");
        let v = self.request(Method::GET, &path, None, None).await?;
        serde_json::from_value(v).map_err(|e| MatrixError::Other {
            status: 0,
            errcode: "M_BAD_JSON".to_string(),
            message: e.to_string(),
        })
    }

    async fn get_account_data(&self, user_id: &str, key: &str) -> Result<Value, MatrixError> {
        let path = format!("/_matrix/client/v3/user/{user_id}/account_data/{key}");
        self.request(Method::GET, &path, None, None).await
    }

    async fn put_account_data(&self, user_id: &str, key: &str, value: &Value) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/user/{user_id}/account_data/{key}");
        self.request(Method::PUT, &path, None, Some(value)).await?;
        Ok(())
    }

    async fn get_room_account_data(&self, user_id: &str, room_id: &str, key: &str) -> Result<Value, MatrixError> {
        let path = format!("/_matrix/client/v3/user/{user_id}/rooms/{room_id}/account_data/{key}");
        self.request(Method::GET, &path, None, None).await
    }

    async fn put_room_account_data(
        &self,
        user_id: &str,
        room_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/user/{user_id}/rooms/{room_id}/account_data/{key}");
        self.request(Method::PUT, &path, None, Some(value)).await?;
        Ok(())
    }

    async fn get_state_event(&self, room_id: &str, event_type: &str, state_key: &str) -> Result<Value, MatrixError> {
        let path = format!("/_matrix/client/v3/rooms/{room_id}/state/{event_type}/{state_key}");
        self.request(Method::GET, &path, None, None).await
    }

    async fn send_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: Value,
        user_id: Option<&str>,
    ) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/rooms/{room_id}/state/{event_type}/{state_key}");
        self.request(Method::PUT, &path, user_id, Some(&content)).await?;
        Ok(())
    }

    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: Value,
        user_id: Option<&str>,
    ) -> Result<SendEventResponse, MatrixError> {
        let txn_id = format!("{}-{}", self.txn_epoch, self.next_txn_id());
        let path = format!("/_matrix/client/v3/rooms/{room_id}/send/{event_type}/{txn_id}");
        let v = self.request(Method::PUT, &path, user_id, Some(&content)).await?;
        serde_json::from_value(v).map_err(|e| MatrixError::Other {
            status: 0,
            errcode: "M_BAD_JSON".to_string(),
            message: e.to_string(),
        })
    }

    async fn create_room(&self, req: &CreateRoomRequest, user_id: Option<&str>) -> Result<CreateRoomResponse, MatrixError> {
        let body = serde_json::to_value(req).map_err(|e| MatrixError::Other {
            status: 0,
            errcode: "M_BAD_JSON".to_string(),
            message: e.to_string(),
        })?;
        let v = self.request(Method::POST, "/_matrix/client/v3/createRoom", user_id, Some(&body)).await?;
        serde_json::from_value(v).map_err(|e| MatrixError::Other {
            status: 0,
            errcode: "M_BAD_JSON".to_string(),
            message: e.to_string(),
        })
    }

    async fn invite(&self, room_id: &str, user_id: &str, as_user: Option<&str>) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/rooms/{room_id}/invite");
        self.request(Method::POST, &path, as_user, Some(&json!({ "user_id": user_id }))).await?;
        Ok(())
    }

    async fn join_room(&self, room_id_or_alias: &str, user_id: Option<&str>) -> Result<(), MatrixError> {
        let encoded = percent_encoding::utf8_percent_encode(room_id_or_alias, percent_encoding::NON_ALPHANUMERIC);
        let path = format!("/_matrix/client/v3/join/{encoded}");
        self.request(Method::POST, &path, user_id, Some(&json!({}))).await?;
        Ok(())
    }

    async fn leave_room(&self, room_id: &str, user_id: Option<&str>) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/rooms/{room_id}/leave");
        self.request(Method::POST, &path, user_id, Some(&json!({}))).await?;
        Ok(())
    }

    async fn kick(&self, room_id: &str, user_id: &str, reason: Option<&str>) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/rooms/{room_id}/kick");
        let mut body = json!({ "user_id": user_id });
        if let Some(reason) = reason {
            body["reason"] = Value::String(reason.to_string());
        }
        self.request(Method::POST, &path, None, Some(&body)).await?;
        Ok(())
    }

    async fn forget_room(&self, room_id: &str, user_id: Option<&str>) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/rooms/{room_id}/forget");
        self.request(Method::POST, &path, user_id, Some(&json!({}))).await?;
        Ok(())
    }

    async fn register_user(&self, localpart: &str) -> Result<RegisterResponse, MatrixError> {
        let body = json!({
            "type": "m.login.application_service",
            "username": localpart,
        });
        let v = self
            .request(Method::POST, "/_matrix/client/v3/register", None, Some(&body))
            .await?;
        serde_json::from_value(v).map_err(|e| MatrixError::Other {
            status: 0,
            errcode: "M_BAD_JSON".to_string(),
            message: e.to_string(),
        })
    }

    async fn set_displayname(&self, user_id: &str, name: &str) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/profile/{user_id}/displayname");
        self.request(Method::PUT, &path, Some(user_id), Some(&json!({ "displayname": name }))).await?;
        Ok(())
    }

    async fn set_avatar_url(&self, user_id: &str, mxc: &str) -> Result<(), MatrixError> {
        let path = format!("/_matrix/client/v3/profile/{user_id}/avatar_url");
        self.request(Method::PUT, &path, Some(user_id), Some(&json!({ "avatar_url": mxc }))).await?;
        Ok(())
    }

    async fn upload_media(&self, bytes: Vec<u8>, content_type: &str, filename: &str) -> Result<String, MatrixError> {
        let url = format!(
            "{}/_matrix/media/v3/upload?filename={}",
            self.homeserver,
            percent_encoding::utf8_percent_encode(filename, percent_encoding::NON_ALPHANUMERIC)
        );
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.as_token)
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await
            .map_err(MatrixError::from)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            let errcode = body.get("errcode").and_then(Value::as_str).unwrap_or("M_UNKNOWN");
            let message = body.get("error").and_then(Value::as_str).unwrap_or("");
            return Err(MatrixError::from_response(status, errcode, message));
        }
        let v: Value = resp.json().await.map_err(MatrixError::from)?;
        v.get("content_uri")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| MatrixError::Other {
                status: 0,
                errcode: "M_BAD_JSON".to_string(),
                message: "upload response missing content_uri".to_string(),
            })
    }

    async fn synapse_admin_is_admin(&self, user_id: &str) -> Result<bool, MatrixError> {
        let path = format!("/_synapse/admin/v1/users/{user_id}/admin");
        match self.request(Method::GET, &path, None, None).await {
            Ok(v) => Ok(v.get("admin").and_then(Value::as_bool).unwrap_or(false)),
            Err(MatrixError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn synapse_admin_join(&self, room_id_or_alias: &str, user_id: &str) -> Result<(), MatrixError> {
        let encoded = percent_encoding::utf8_percent_encode(room_id_or_alias, percent_encoding::NON_ALPHANUMERIC);
        let path = format!("/_synapse/admin/v1/join/{encoded}");
        debug!("synapse admin join {room_id_or_alias} as {user_id}");
        self.request(Method::POST, &path, None, Some(&json!({ "user_id": user_id }))).await?;
        Ok(())
    }
}

/// Constructs the bridge's own sender localpart from the registration (6).
pub fn bot_user_id(sender_localpart: &str, server_name: &str) -> String {
    format!("@{sender_localpart}:{server_name}")
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory `MatrixApi` fake that records every sent `m.room.message`
    /// body, for use by queue/room unit tests that should not talk HTTP.
    #[derive(Default)]
    pub struct RecordingMatrixApi {
        sent: Mutex<Vec<(String, String)>>,
        account_data: Mutex<HashMap<String, Value>>,
        registered: Mutex<Vec<String>>,
    }

    impl RecordingMatrixApi {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent_bodies(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, b)| b.clone()).collect()
        }

        pub fn registered_localparts(&self) -> Vec<String> {
            self.registered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MatrixApi for RecordingMatrixApi {
        async fn whoami(&self) -> Result<WhoAmI, MatrixError> {
            Ok(WhoAmI { user_id: "@bot:test".to_string() })
        }

        async fn joined_rooms(&self) -> Result<JoinedRooms, MatrixError> {
            Ok(JoinedRooms { joined_rooms: vec![] })
        }

        async fn joined_members(&self, _room_id: &str) -> Result<JoinedMembers, MatrixError> {
            Ok(JoinedMembers { joined: HashMap::new() })
        }

        async fn get_account_data(&self, user_id: &str, key: &str) -> Result<Value, MatrixError> {
            self.account_data
                .lock()
                .unwrap()
                .get(&format!("{user_id}/{key}"))
                .cloned()
                .ok_or(MatrixError::NotFound)
        }

        async fn put_account_data(&self, user_id: &str, key: &str, value: &Value) -> Result<(), MatrixError> {
            self.account_data
                .lock()
                .unwrap()
                .insert(format!("{user_id}/{key}"), value.clone());
            Ok(())
        }

        async fn get_room_account_data(&self, user_id: &str, room_id: &str, key: &str) -> Result<Value, MatrixError> {
            self.account_data
                .lock()
                .unwrap()
                .get(&format!("{user_id}/{room_id}/{key}"))
                .cloned()
                .ok_or(MatrixError::NotFound)
        }

        async fn put_room_account_data(
            &self,
            user_id: &str,
            room_id: &str,
            key: &str,
            value: &Value,
        ) -> Result<(), MatrixError> {
            self.account_data
                .lock()
                .unwrap()
                .insert(format!("{user_id}/{room_id}/{key}"), value.clone());
            Ok(())
        }

        async fn get_state_event(&self, _room_id: &str, _event_type: &str, _state_key: &str) -> Result<Value, MatrixError> {
            Err(MatrixError::NotFound)
        }

        async fn send_state(
            &self,
            _room_id: &str,
            _event_type: &str,
            _state_key: &str,
            _content: Value,
            _user_id: Option<&str>,
        ) -> Result<(), MatrixError> {
            Ok(())
        }

        async fn send_event(
            &self,
            room_id: &str,
            _event_type: &str,
            content: Value,
            _user_id: Option<&str>,
        ) -> Result<SendEventResponse, MatrixError> {
            let body = content.get("body").and_then(Value::as_str).unwrap_or("").to_string();
            self.sent.lock().unwrap().push((room_id.to_string(), body));
            Ok(SendEventResponse { event_id: format!("$evt{}", self.sent.lock().unwrap().len()) })
        }

        async fn create_room(&self, _req: &CreateRoomRequest, _user_id: Option<&str>) -> Result<CreateRoomResponse, MatrixError> {
            Ok(CreateRoomResponse { room_id: "!new:test".to_string() })
        }

        async fn invite(&self, _room_id: &str, _user_id: &str, _as_user: Option<&str>) -> Result<(), MatrixError> {
            Ok(())
        }

        async fn join_room(&self, _room_id_or_alias: &str, _user_id: Option<&str>) -> Result<(), MatrixError> {
            Ok(())
        }

        async fn leave_room(&self, _room_id: &str, _user_id: Option<&str>) -> Result<(), MatrixError> {
            Ok(())
        }

        async fn kick(&self, _room_id: &str, _user_id: &str, _reason: Option<&str>) -> Result<(), MatrixError> {
            Ok(())
        }

        async fn forget_room(&self, _room_id: &str, _user_id: Option<&str>) -> Result<(), MatrixError> {
            Ok(())
        }

        async fn register_user(&self, localpart: &str) -> Result<RegisterResponse, MatrixError> {
            self.registered.lock().unwrap().push(localpart.to_string());
            Ok(RegisterResponse { user_id: format!("@{localpart}:test") })
        }

        async fn set_displayname(&self, _user_id: &str, _name: &str) -> Result<(), MatrixError> {
            Ok(())
        }

        async fn set_avatar_url(&self, _user_id: &str, _mxc: &str) -> Result<(), MatrixError> {
            Ok(())
        }

        async fn upload_media(&self, _bytes: Vec<u8>, _content_type: &str, _filename: &str) -> Result<String, MatrixError> {
            Ok("mxc://test/abc".to_string())
        }

        async fn synapse_admin_is_admin(&self, _user_id: &str) -> Result<bool, MatrixError> {
            Ok(false)
        }

        async fn synapse_admin_join(&self, _room_id_or_alias: &str, _user_id: &str) -> Result<(), MatrixError> {
            Ok(())
        }
    }
}
