use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct WhoAmI {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinedRooms {
    pub joined_rooms: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct JoinedMember {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JoinedMembers {
    pub joined: HashMap<String, JoinedMember>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomResponse {
    pub room_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendEventResponse {
    pub event_id: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinRules {
    pub join_rule: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateRoomRequest {
    pub visibility: &'static str,
    pub name: String,
    pub topic: String,
    pub invite: Vec<String>,
    pub is_direct: bool,
    pub power_level_content_override: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_version: Option<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub initial_state: Vec<Value>,
}

pub fn default_power_levels() -> Value {
    serde_json::json!({
        "users_default": 0,
        "invite": 100,
        "kick": 100,
        "redact": 100,
        "ban": 100,
        "events": {
            "m.room.name": 0,
            "m.room.avatar": 0,
        },
    })
}
