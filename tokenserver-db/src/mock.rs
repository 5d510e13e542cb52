//! Mock db implementation with methods stubbed to return default values,
//! for tokenserver extractor and handler tests.
#![allow(clippy::new_without_default)]
use async_trait::async_trait;
use weaveserver_common::Metrics;
use weaveserver_db_common::{GetPoolState, PoolState};

use super::{params, results, Db, DbPool, DbResult};

#[derive(Clone)]
pub struct MockDbPool;

impl MockDbPool {
    pub fn new() -> Self {
        MockDbPool
    }
}

#[async_trait(?Send)]
impl DbPool for MockDbPool {
    async fn init(&mut self) -> DbResult<()> {
        Ok(())
    }

    async fn get(&self) -> DbResult<Box<dyn Db>> {
        Ok(Box::new(MockDb::new()) as Box<dyn Db>)
    }

    fn box_clone(&self) -> Box<dyn DbPool> {
        Box::new(self.clone())
    }
}

impl GetPoolState for MockDbPool {
    fn state(&self) -> PoolState {
        PoolState::default()
    }
}

#[derive(Clone)]
pub struct MockDb {
    metrics: Metrics,
}

impl MockDb {
    pub fn new() -> Self {
        Self {
            metrics: Metrics::noop(),
        }
    }
}

#[async_trait(?Send)]
impl Db for MockDb {
    async fn replace_user(
        &mut self,
        _params: params::ReplaceUser,
    ) -> DbResult<results::ReplaceUser> {
        Ok(())
    }

    async fn replace_users(
        &mut self,
        _params: params::ReplaceUsers,
    ) -> DbResult<results::ReplaceUsers> {
        Ok(())
    }

    async fn post_user(&mut self, _params: params::PostUser) -> DbResult<results::PostUser> {
        Ok(Default::default())
    }

    async fn put_user(&mut self, _params: params::PutUser) -> DbResult<results::PutUser> {
        Ok(())
    }

    async fn retire_user(&mut self, _params: params::RetireUser) -> DbResult<results::RetireUser> {
        Ok(())
    }

    async fn check(&mut self) -> DbResult<results::Check> {
        Ok(true)
    }

    async fn get_node_id(&mut self, _params: params::GetNodeId) -> DbResult<results::GetNodeId> {
        Ok(Default::default())
    }

    async fn get_best_node(
        &mut self,
        _params: params::GetBestNode,
    ) -> DbResult<results::GetBestNode> {
        Ok(Default::default())
    }

    async fn add_user_to_node(
        &mut self,
        _params: params::AddUserToNode,
    ) -> DbResult<results::AddUserToNode> {
        Ok(())
    }

    async fn get_users(&mut self, _params: params::GetUsers) -> DbResult<results::GetUsers> {
        Ok(Default::default())
    }

    async fn get_service_id(
        &mut self,
        _params: params::GetServiceId,
    ) -> DbResult<results::GetServiceId> {
        Ok(Default::default())
    }

    async fn post_node(&mut self, _params: params::PostNode) -> DbResult<results::PostNode> {
        Ok(Default::default())
    }

    async fn get_node(&mut self, _params: params::GetNode) -> DbResult<results::GetNode> {
        Ok(Default::default())
    }

    async fn unassign_node(
        &mut self,
        _params: params::UnassignNode,
    ) -> DbResult<results::UnassignNode> {
        Ok(())
    }

    async fn remove_node(&mut self, _params: params::RemoveNode) -> DbResult<results::RemoveNode> {
        Ok(())
    }

    async fn post_service(
        &mut self,
        _params: params::PostService,
    ) -> DbResult<results::PostService> {
        Ok(Default::default())
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    async fn get_or_create_user(
        &mut self,
        _params: params::GetOrCreateUser,
    ) -> DbResult<results::GetOrCreateUser> {
        Ok(Default::default())
    }

    async fn allocate_user(
        &mut self,
        _params: params::AllocateUser,
    ) -> DbResult<results::AllocateUser> {
        Ok(Default::default())
    }

    #[cfg(debug_assertions)]
    async fn set_user_created_at(
        &mut self,
        _params: params::SetUserCreatedAt,
    ) -> DbResult<results::SetUserCreatedAt> {
        Ok(())
    }

    #[cfg(debug_assertions)]
    async fn set_user_replaced_at(
        &mut self,
        _params: params::SetUserReplacedAt,
    ) -> DbResult<results::SetUserReplacedAt> {
        Ok(())
    }

    #[cfg(debug_assertions)]
    async fn get_user(&mut self, _params: params::GetUser) -> DbResult<results::GetUser> {
        Ok(Default::default())
    }
}
