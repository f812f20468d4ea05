//! Access handle given to checks and operations.
//!
//! Checks and operations run while the tree's session is already locked by
//! the public call that triggered them. [`Access`] carries that locked
//! session together with the node being accessed, so nested reads go
//! through the same engine (gates, checks, cache) without locking again.

use crate::error::InstrResult;
use crate::node::{get_feature, invoke_action, resolve_subsystem, set_feature, Node};
use crate::session::Session;
use crate::value::{ChannelId, Value};
use std::sync::Arc;

/// A node plus the session currently held for its tree.
#[derive(Debug)]
pub struct Access<'s> {
    node: Arc<Node>,
    session: &'s mut Session,
}

impl<'s> Access<'s> {
    pub(crate) fn new(node: Arc<Node>, session: &'s mut Session) -> Self {
        Self { node, session }
    }

    /// Node the check or operation is attached to.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Canonical id when the node is a channel.
    pub fn channel_id(&self) -> Option<&ChannelId> {
        self.node.channel_id()
    }

    /// The locked session, for raw exchanges.
    pub fn session(&mut self) -> &mut Session {
        &mut *self.session
    }

    /// Read a feature of this node.
    pub async fn get(&mut self, name: &str) -> InstrResult<Value> {
        get_feature(Arc::clone(&self.node), &mut *self.session, name).await
    }

    /// Write a feature of this node.
    pub async fn set(&mut self, name: &str, value: Value) -> InstrResult<()> {
        set_feature(Arc::clone(&self.node), &mut *self.session, name, value).await
    }

    /// Call an action of this node.
    pub async fn invoke(&mut self, name: &str, args: &[Value]) -> InstrResult<Value> {
        invoke_action(Arc::clone(&self.node), &mut *self.session, name, args).await
    }

    /// Access a subsystem of this node.
    pub async fn subsystem(&mut self, name: &str) -> InstrResult<Access<'_>> {
        let child = resolve_subsystem(Arc::clone(&self.node), &mut *self.session, name).await?;
        Ok(Access::new(child, &mut *self.session))
    }

    /// Access the parent node, `None` on the root.
    pub fn parent(&mut self) -> Option<Access<'_>> {
        let parent = self.node.parent()?;
        Some(Access::new(parent, &mut *self.session))
    }

    /// Access another node of the same tree.
    pub fn with_node(&mut self, node: Arc<Node>) -> Access<'_> {
        Access::new(node, &mut *self.session)
    }

    /// Raw query on the session, outside of any feature.
    pub async fn query(&mut self, command: &str) -> InstrResult<String> {
        let member = self.node.path().to_string();
        self.session.query(command, &member).await
    }

    /// Raw write on the session, confirmed with the acknowledgement policy.
    pub async fn write(&mut self, template: &str, value: Option<&str>) -> InstrResult<String> {
        let member = self.node.path().to_string();
        self.session.write(template, value, &member).await
    }
}
