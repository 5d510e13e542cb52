//! Parameter types for the tokenserver database methods.

/// Gets the user's current record, or allocates a new one.
#[derive(Clone, Debug, Default)]
pub struct GetOrCreateUser {
    pub service_id: i32,
    pub email: String,
    pub generation: i64,
    pub client_state: String,
    pub keys_changed_at: Option<i64>,
    pub capacity_release_rate: Option<f32>,
}

pub type AllocateUser = GetOrCreateUser;

#[derive(Clone, Debug, Default)]
pub struct PostUser {
    pub service_id: i32,
    pub email: String,
    pub generation: i64,
    pub client_state: String,
    pub created_at: i64,
    pub node_id: i64,
    pub keys_changed_at: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct PutUser {
    pub service_id: i32,
    pub email: String,
    pub generation: i64,
    pub keys_changed_at: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct ReplaceUser {
    pub uid: i64,
    pub service_id: i32,
    pub replaced_at: i64,
}

#[derive(Clone, Debug, Default)]
pub struct ReplaceUsers {
    pub service_id: i32,
    pub email: String,
    pub replaced_at: i64,
}

#[derive(Clone, Debug, Default)]
pub struct RetireUser {
    pub service_id: i32,
    pub email: String,
}

#[derive(Clone, Debug, Default)]
pub struct GetUsers {
    pub service_id: i32,
    pub email: String,
}

#[derive(Clone, Debug, Default)]
pub struct GetNodeId {
    pub service_id: i32,
    pub node: String,
}

#[derive(Clone, Debug, Default)]
pub struct GetBestNode {
    pub service_id: i32,
    pub capacity_release_rate: Option<f32>,
}

#[derive(Clone, Debug, Default)]
pub struct AddUserToNode {
    pub service_id: i32,
    pub node: String,
}

#[derive(Clone, Debug, Default)]
pub struct GetServiceId {
    pub service: String,
}

#[derive(Clone, Debug, Default)]
pub struct PostNode {
    pub service_id: i32,
    pub node: String,
    pub available: i32,
    pub current_load: i32,
    pub capacity: i32,
    pub downed: i32,
    pub backoff: i32,
}

#[derive(Clone, Debug, Default)]
pub struct GetNode {
    pub id: i64,
}

#[derive(Clone, Debug, Default)]
pub struct UnassignNode {
    pub node_id: i64,
}

#[derive(Clone, Debug, Default)]
pub struct RemoveNode {
    pub node_id: i64,
}

#[derive(Clone, Debug, Default)]
pub struct PostService {
    pub service: String,
    pub pattern: String,
}

#[cfg(debug_assertions)]
#[derive(Clone, Debug, Default)]
pub struct SetUserCreatedAt {
    pub uid: i64,
    pub created_at: i64,
}

#[cfg(debug_assertions)]
#[derive(Clone, Debug, Default)]
pub struct SetUserReplacedAt {
    pub uid: i64,
    pub replaced_at: i64,
}

#[cfg(debug_assertions)]
#[derive(Clone, Debug, Default)]
pub struct GetUser {
    pub id: i64,
}
