#[macro_use]
extern crate diesel;
#[macro_use]
extern crate slog_scope;

mod error;
pub mod mock;
mod models;
pub mod params;
mod pool;
pub mod results;
#[cfg(test)]
mod tests;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use weaveserver_common::Metrics;
use weaveserver_db_common::{GetPoolState, PoolState};

pub use error::DbError;
pub use models::TokenserverDb;
pub use pool::{pool_from_settings, TokenserverPool};

pub type DbResult<T> = Result<T, DbError>;

/// The maximum possible generation number. Used as a tombstone to mark
/// users that have been "retired" from the db.
pub const MAX_GENERATION: i64 = i64::MAX;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[async_trait(?Send)]
pub trait DbPool: Sync + Send + GetPoolState {
    async fn init(&mut self) -> DbResult<()>;

    async fn get(&self) -> DbResult<Box<dyn Db>>;

    fn box_clone(&self) -> Box<dyn DbPool>;
}

impl GetPoolState for Box<dyn DbPool> {
    fn state(&self) -> PoolState {
        (**self).state()
    }
}

impl Clone for Box<dyn DbPool> {
    fn clone(&self) -> Box<dyn DbPool> {
        self.box_clone()
    }
}

#[async_trait(?Send)]
pub trait Db {
    /// Return the Db instance timeout duration.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Mark the user with the given uid and service ID as being replaced.
    async fn replace_user(&mut self, params: params::ReplaceUser)
        -> DbResult<results::ReplaceUser>;

    /// Mark users matching the given email and service ID as replaced.
    async fn replace_users(
        &mut self,
        params: params::ReplaceUsers,
    ) -> DbResult<results::ReplaceUsers>;

    /// Insert a complete user record and return its uid.
    async fn post_user(&mut self, params: params::PostUser) -> DbResult<results::PostUser>;

    /// Bump the generation and/or keys_changed_at on the user's current
    /// record, guarded so concurrent updates can't move either backwards.
    async fn put_user(&mut self, params: params::PutUser) -> DbResult<results::PutUser>;

    /// Retire the user: tombstone every record with the maximum generation.
    async fn retire_user(&mut self, params: params::RetireUser)
        -> DbResult<results::RetireUser>;

    /// Report database health as a boolean.
    async fn check(&mut self) -> DbResult<results::Check>;

    /// Get a node's ID from its service and url.
    async fn get_node_id(&mut self, params: params::GetNodeId) -> DbResult<results::GetNodeId>;

    /// Get the least-loaded eligible node, releasing reserved capacity as
    /// needed.
    async fn get_best_node(
        &mut self,
        params: params::GetBestNode,
    ) -> DbResult<results::GetBestNode>;

    /// Account for a new assignment to the given node.
    async fn add_user_to_node(
        &mut self,
        params: params::AddUserToNode,
    ) -> DbResult<results::AddUserToNode>;

    /// Get every record (current and replaced) for an email and service.
    async fn get_users(&mut self, params: params::GetUsers) -> DbResult<results::GetUsers>;

    /// Resolve a service's id from its name.
    async fn get_service_id(
        &mut self,
        params: params::GetServiceId,
    ) -> DbResult<results::GetServiceId>;

    /// Insert a node record.
    async fn post_node(&mut self, params: params::PostNode) -> DbResult<results::PostNode>;

    /// Get a full node record by id.
    async fn get_node(&mut self, params: params::GetNode) -> DbResult<results::GetNode>;

    /// Mark every user currently assigned to a node as replaced so they get
    /// reallocated on their next request.
    async fn unassign_node(
        &mut self,
        params: params::UnassignNode,
    ) -> DbResult<results::UnassignNode>;

    /// Remove a node entirely, clearing its users' assignments.
    async fn remove_node(&mut self, params: params::RemoveNode) -> DbResult<results::RemoveNode>;

    /// Create a service record, returning its id.
    async fn post_service(&mut self, params: params::PostService)
        -> DbResult<results::PostService>;

    /// Return the Db instance Metrics.
    fn metrics(&self) -> &Metrics;

    /// Gets the user's current record for the email and service, or
    /// allocates one.
    ///
    /// Sibling records left behind by racing creations are merged: the
    /// record with the greatest `(generation, created_at)` wins and the
    /// rest are marked replaced by it.
    async fn get_or_create_user(
        &mut self,
        params: params::GetOrCreateUser,
    ) -> DbResult<results::GetOrCreateUser> {
        let mut raw_users = self
            .get_users(params::GetUsers {
                service_id: params.service_id,
                email: params.email.clone(),
            })
            .await?;

        if raw_users.is_empty() {
            // There are no users in the database with the given email and
            // service ID, so allocate a new one.
            let allocate_user_result = self.allocate_user(params.clone()).await?;

            Ok(results::GetOrCreateUser {
                uid: allocate_user_result.uid,
                email: params.email,
                client_state: params.client_state,
                generation: params.generation,
                node: allocate_user_result.node,
                keys_changed_at: params.keys_changed_at,
                created_at: allocate_user_result.created_at,
                replaced_at: None,
                first_seen_at: allocate_user_result.created_at,
                old_client_states: vec![],
            })
        } else {
            raw_users.sort_by_key(|raw_user| (raw_user.generation, raw_user.created_at));
            raw_users.reverse();

            // The user with the greatest `generation` and `created_at` is
            // the current user
            let raw_user = raw_users[0].clone();

            // Collect any old client states that differ from the current
            // client state
            let old_client_states: Vec<String> = {
                raw_users[1..]
                    .iter()
                    .map(|user| user.client_state.clone())
                    .filter(|client_state| client_state != &raw_user.client_state)
                    .collect()
            };

            // Make sure every old row is marked as replaced. They might not
            // be, due to races in row creation.
            for old_user in &raw_users[1..] {
                if old_user.replaced_at.is_none() {
                    let params = params::ReplaceUser {
                        uid: old_user.uid,
                        service_id: params.service_id,
                        replaced_at: raw_user.created_at,
                    };

                    self.replace_user(params).await?;
                }
            }

            let first_seen_at = raw_users[raw_users.len() - 1].created_at;

            match (raw_user.replaced_at, raw_user.node) {
                // If the most up-to-date user is marked as replaced or
                // doesn't have a node assignment, allocate a new user. Note
                // the new record duplicates the *stored* account metadata,
                // not the metadata in the request params: the request's
                // values may not have been validated against this record
                // yet.
                (Some(_), _) | (_, None) if raw_user.generation < MAX_GENERATION => {
                    let allocate_user_result = {
                        self.allocate_user(params::AllocateUser {
                            service_id: params.service_id,
                            email: params.email.clone(),
                            generation: raw_user.generation,
                            client_state: raw_user.client_state.clone(),
                            keys_changed_at: raw_user.keys_changed_at,
                            capacity_release_rate: params.capacity_release_rate,
                        })
                        .await?
                    };

                    Ok(results::GetOrCreateUser {
                        uid: allocate_user_result.uid,
                        email: params.email,
                        client_state: raw_user.client_state,
                        generation: raw_user.generation,
                        node: allocate_user_result.node,
                        keys_changed_at: raw_user.keys_changed_at,
                        created_at: allocate_user_result.created_at,
                        replaced_at: None,
                        first_seen_at,
                        old_client_states,
                    })
                }
                // The most up-to-date user has a node. Note that this user
                // may be retired or replaced.
                (_, Some(node)) => Ok(results::GetOrCreateUser {
                    uid: raw_user.uid,
                    email: params.email,
                    client_state: raw_user.client_state,
                    generation: raw_user.generation,
                    node,
                    keys_changed_at: raw_user.keys_changed_at,
                    created_at: raw_user.created_at,
                    replaced_at: None,
                    first_seen_at,
                    old_client_states,
                }),
                // The most up-to-date user doesn't have a node and is
                // retired. This is an internal service error for
                // compatibility reasons (the legacy server returned an
                // internal service error in this situation).
                (_, None) => {
                    let uid = raw_user.uid;
                    warn!("Tokenserver user retired"; "uid" => &uid);
                    Err(DbError::internal("Tokenserver user retired".to_owned()))
                }
            }
        }
    }

    /// Creates a new user and assigns them to a node.
    async fn allocate_user(
        &mut self,
        params: params::AllocateUser,
    ) -> DbResult<results::AllocateUser> {
        let mut metrics = self.metrics().clone();
        metrics.start_timer("storage.allocate_user", None);

        // Get the least-loaded node
        let node = self
            .get_best_node(params::GetBestNode {
                service_id: params.service_id,
                capacity_release_rate: params.capacity_release_rate,
            })
            .await?;

        // Decrement `available` and increment `current_load` on the node
        // assigned to the user.
        self.add_user_to_node(params::AddUserToNode {
            service_id: params.service_id,
            node: node.node.clone(),
        })
        .await?;

        let created_at = now_millis();
        let uid = self
            .post_user(params::PostUser {
                service_id: params.service_id,
                email: params.email.clone(),
                generation: params.generation,
                client_state: params.client_state.clone(),
                created_at,
                node_id: node.id,
                keys_changed_at: params.keys_changed_at,
            })
            .await?
            .uid;

        Ok(results::AllocateUser {
            uid,
            node: node.node,
            created_at,
        })
    }

    // Test-only helpers used to construct ledger fixtures

    #[cfg(debug_assertions)]
    async fn set_user_created_at(
        &mut self,
        params: params::SetUserCreatedAt,
    ) -> DbResult<results::SetUserCreatedAt>;

    #[cfg(debug_assertions)]
    async fn set_user_replaced_at(
        &mut self,
        params: params::SetUserReplacedAt,
    ) -> DbResult<results::SetUserReplacedAt>;

    #[cfg(debug_assertions)]
    async fn get_user(&mut self, params: params::GetUser) -> DbResult<results::GetUser>;
}
