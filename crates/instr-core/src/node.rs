//! Live node tree: drivers, subsystems and channels.
//!
//! A [`Driver`] owns the root [`Node`]. Subsystem and channel nodes are
//! created lazily on first access and memoized by their parent, so the same
//! `(parent, name)` or `(parent, family, canonical id)` always yields the
//! same `Arc<Node>`. Children point back to their parent with a `Weak`
//! reference only.
//!
//! Every node of a tree shares one `tokio::sync::Mutex<Session>`. Public
//! operations take that lock once and hold it for the whole resolution,
//! including the nested reads issued by gates, checks and id listings, so
//! exchanges of a tree are strictly ordered and per-node state is only
//! mutated under the lock.
//!
//! # Resolution order
//!
//! - get: gate -> checks -> cache -> query -> decode -> store
//! - set: validate -> gate -> checks -> named limits -> encode ->
//!   write/ack -> store -> stale dependents -> discard limits
//! - invoke: validate arguments -> gate -> checks -> operation -> convert
//!
//! An alias feature runs its own gate and checks, then forwards to its
//! target without caching anything itself.
//!
//! # Example
//!
//! ```rust,ignore
//! let driver = Driver::open(schema, backend, SessionOptions::default());
//! driver.set("frequency", 250.5).await?;
//! assert_eq!(driver.get("frequency").await?, Value::Float(250.5)); // from cache
//!
//! let main = driver.channel("output", "main").await?;
//! assert!(Arc::ptr_eq(&main, &driver.channel("output", 1).await?));
//! ```

use crate::access::Access;
use crate::check::{Check, CheckInput};
use crate::error::{InstrError, InstrResult};
use crate::gate::Gate;
use crate::named_limits::Limits;
use crate::path::{MemberPath, PathSegment};
use crate::schema::{
    ActionDescriptor, AliasTarget, CachePolicy, ChannelDescriptor, DriverSchema,
    FeatureDescriptor, IdSource, Member, NodeSchema, SubsystemDescriptor,
};
use crate::session::{substitute, BackendAdapter, Session, SessionOptions};
use crate::value::{ChannelId, Value};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

// =============================================================================
// Node state
// =============================================================================

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    fresh: bool,
}

#[derive(Default)]
struct NodeState {
    cache: HashMap<String, CacheEntry>,
    gates: HashMap<String, bool>,
    limits: HashMap<String, Limits>,
    subsystems: HashMap<String, Arc<Node>>,
    channels: BTreeMap<(String, ChannelId), Arc<Node>>,
    channel_ids: HashMap<String, Vec<ChannelId>>,
}

struct Tree {
    session: tokio::sync::Mutex<Session>,
    driver: Arc<DriverSchema>,
}

/// One live driver, subsystem or channel instance.
pub struct Node {
    schema: Arc<NodeSchema>,
    parent: Weak<Node>,
    tree: Arc<Tree>,
    path: String,
    channel: Option<(String, ChannelId)>,
    is_root: bool,
    state: Mutex<NodeState>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("path", &self.path)
            .field("channel", &self.channel)
            .finish()
    }
}

impl Node {
    fn child(
        parent: &Arc<Node>,
        schema: Arc<NodeSchema>,
        segment: String,
        channel: Option<(String, ChannelId)>,
    ) -> Arc<Node> {
        Arc::new(Node {
            schema,
            parent: Arc::downgrade(parent),
            tree: Arc::clone(&parent.tree),
            path: format!("{}.{}", parent.path, segment),
            channel,
            is_root: false,
            state: Mutex::new(NodeState::default()),
        })
    }

    /// Full path, e.g. `SIM-FG100.output[1]`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Compiled type of this node.
    pub fn schema(&self) -> &Arc<NodeSchema> {
        &self.schema
    }

    /// Schema of the driver this node belongs to.
    pub fn driver_schema(&self) -> &Arc<DriverSchema> {
        &self.tree.driver
    }

    /// Canonical id when this node is a channel.
    pub fn channel_id(&self) -> Option<&ChannelId> {
        self.channel.as_ref().map(|(_, id)| id)
    }

    /// Channel family name when this node is a channel.
    pub fn family(&self) -> Option<&str> {
        self.channel.as_ref().map(|(family, _)| family.as_str())
    }

    /// Parent node, `None` for the root or once the parent is gone.
    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.upgrade()
    }

    /// Whether this node is the driver itself.
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    fn member_path(&self, name: &str) -> String {
        format!("{}.{}", self.path, name)
    }

    /// Ids of the enclosing channels, nearest first.
    pub fn channel_context(&self) -> Vec<(String, ChannelId)> {
        let mut out = Vec::new();
        if let Some(ch) = &self.channel {
            out.push(ch.clone());
        }
        let mut current = self.parent.upgrade();
        while let Some(node) = current {
            if let Some(ch) = &node.channel {
                out.push(ch.clone());
            }
            current = node.parent.upgrade();
        }
        out
    }

    fn ensure_attached(&self) -> InstrResult<()> {
        if self.is_root {
            return Ok(());
        }
        let mut current = self.parent.upgrade();
        while let Some(node) = current {
            if node.is_root {
                return Ok(());
            }
            current = node.parent.upgrade();
        }
        Err(InstrError::Detached {
            node: self.path.clone(),
        })
    }

    // -------------------------------------------------------------------------
    // Cache inspection
    // -------------------------------------------------------------------------

    /// Cached value of a feature if it is fresh.
    pub fn cached(&self, name: &str) -> Option<Value> {
        self.state
            .lock()
            .cache
            .get(name)
            .filter(|entry| entry.fresh)
            .map(|entry| entry.value.clone())
    }

    /// Whether a fresh value of `name` is cached.
    pub fn is_fresh(&self, name: &str) -> bool {
        self.state
            .lock()
            .cache
            .get(name)
            .is_some_and(|entry| entry.fresh)
    }

    /// All fresh cached values of this node.
    pub fn cache_snapshot(&self) -> BTreeMap<String, Value> {
        self.state
            .lock()
            .cache
            .iter()
            .filter(|(_, entry)| entry.fresh)
            .map(|(name, entry)| (name.clone(), entry.value.clone()))
            .collect()
    }

    /// Memoized result of a gate on this node, `None` if never evaluated.
    pub fn gate_result(&self, gate: &str) -> Option<bool> {
        self.state.lock().gates.get(gate).copied()
    }

    /// Named limits resolved on this node, if still kept.
    pub fn cached_limits(&self, name: &str) -> Option<Limits> {
        self.state.lock().limits.get(name).copied()
    }

    /// Ids of the channel instances of `family` created so far.
    pub fn instantiated_channels(&self, family: &str) -> Vec<ChannelId> {
        self.state
            .lock()
            .channels
            .keys()
            .filter(|(f, _)| f == family)
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn store_write(&self, feature: &FeatureDescriptor, value: Value, cacheable: bool) {
        let mut state = self.state.lock();
        if cacheable {
            state.cache.insert(
                feature.name().to_string(),
                CacheEntry { value, fresh: true },
            );
        } else {
            state.cache.remove(feature.name());
        }
        for dependent in feature.dependents() {
            let keep = self
                .schema
                .feature(dependent)
                .is_some_and(|d| d.cache() == CachePolicy::InstanceLifetime);
            if keep {
                continue;
            }
            if let Some(entry) = state.cache.get_mut(dependent) {
                entry.fresh = false;
                debug!(node = %self.path, feature = %dependent, "dependent staled");
            }
        }
        for name in feature.discard_limits() {
            if state.limits.remove(name).is_some() {
                debug!(node = %self.path, limits = %name, "limits discarded");
            }
        }
    }

    fn invalidate(&self, feature: &FeatureDescriptor) {
        if feature.cache() != CachePolicy::InstanceLifetime {
            self.state.lock().cache.remove(feature.name());
        }
    }

    fn clear_all_locked(&self) {
        let children: Vec<Arc<Node>> = {
            let mut state = self.state.lock();
            let schema = &self.schema;
            state.cache.retain(|name, _| {
                schema
                    .feature(name)
                    .is_some_and(|f| f.cache() == CachePolicy::InstanceLifetime)
            });
            state.limits.clear();
            let children = state
                .subsystems
                .values()
                .chain(state.channels.values())
                .cloned()
                .collect();
            children
        };
        for child in children {
            child.clear_all_locked();
        }
    }

    fn clear_path_locked(&self, segments: &[PathSegment]) -> InstrResult<()> {
        let Some((first, rest)) = segments.split_first() else {
            return Ok(());
        };
        let member = self
            .schema
            .member(&first.name)
            .ok_or_else(|| InstrError::UnknownMember {
                node: self.path.clone(),
                member: first.name.clone(),
            })?;
        let invalid = |message: &str| InstrError::InvalidPath {
            path: self.member_path(&first.name),
            message: message.to_string(),
        };
        let children: Vec<Arc<Node>> = match member {
            Member::Feature(feature) => {
                if !rest.is_empty() || first.id.is_some() {
                    return Err(invalid("a feature has no members"));
                }
                self.invalidate(feature);
                return Ok(());
            }
            Member::Action(_) => return Err(invalid("actions have no cache")),
            Member::Subsystem(_) => {
                if first.id.is_some() {
                    return Err(invalid("a subsystem takes no id"));
                }
                self.state
                    .lock()
                    .subsystems
                    .get(&first.name)
                    .cloned()
                    .into_iter()
                    .collect()
            }
            Member::Channel(desc) => {
                let state = self.state.lock();
                let matching = match &first.id {
                    Some(id) => {
                        let id = desc.canonical(&ChannelId::parse(id));
                        state
                            .channels
                            .get(&(first.name.clone(), id))
                            .cloned()
                            .into_iter()
                            .collect()
                    }
                    None => state
                        .channels
                        .iter()
                        .filter(|((family, _), _)| family == &first.name)
                        .map(|(_, node)| Arc::clone(node))
                        .collect(),
                };
                matching
            }
        };
        for child in children {
            if rest.is_empty() {
                child.clear_all_locked();
            } else {
                child.clear_path_locked(rest)?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Public resolution API
    // -------------------------------------------------------------------------

    /// Read a feature.
    pub async fn get(self: &Arc<Self>, name: &str) -> InstrResult<Value> {
        let mut session = self.tree.session.lock().await;
        get_feature(Arc::clone(self), &mut session, name).await
    }

    /// Write a feature.
    pub async fn set(self: &Arc<Self>, name: &str, value: impl Into<Value>) -> InstrResult<()> {
        let value = value.into();
        let mut session = self.tree.session.lock().await;
        set_feature(Arc::clone(self), &mut session, name, value).await
    }

    /// Call an action.
    pub async fn invoke(self: &Arc<Self>, name: &str, args: &[Value]) -> InstrResult<Value> {
        let mut session = self.tree.session.lock().await;
        invoke_action(Arc::clone(self), &mut session, name, args).await
    }

    /// Singleton child subsystem.
    pub async fn subsystem(self: &Arc<Self>, name: &str) -> InstrResult<Arc<Node>> {
        let mut session = self.tree.session.lock().await;
        resolve_subsystem(Arc::clone(self), &mut session, name).await
    }

    /// Channel instance by canonical id or alias.
    pub async fn channel(
        self: &Arc<Self>,
        family: &str,
        id: impl Into<ChannelId>,
    ) -> InstrResult<Arc<Node>> {
        let id = id.into();
        let mut session = self.tree.session.lock().await;
        resolve_channel(Arc::clone(self), &mut session, family, id).await
    }

    /// Resolve named limits declared on this node, computing them on first
    /// use.
    pub async fn limits(self: &Arc<Self>, name: &str) -> InstrResult<Limits> {
        let mut session = self.tree.session.lock().await;
        self.ensure_attached()?;
        resolve_limits(Arc::clone(self), &mut session, name).await
    }

    /// Valid ids of a channel family.
    pub async fn available_channels(self: &Arc<Self>, family: &str) -> InstrResult<Vec<ChannelId>> {
        let mut session = self.tree.session.lock().await;
        self.ensure_attached()?;
        let schema = Arc::clone(&self.schema);
        let desc = channel_of(self, &schema, family)?;
        let member = self.member_path(family);
        if let Some(gate) = desc.gate() {
            ensure_gate(Arc::clone(self), &mut session, gate, &member).await?;
        }
        channel_ids(Arc::clone(self), &mut session, desc, family).await
    }

    /// Forget cached values addressed by member paths.
    ///
    /// `frequency` clears one feature, `trigger` everything below an existing
    /// subsystem, `output.offset` the feature on every existing instance of
    /// the channel family and `output[1]` one instance. Instance-lifetime
    /// values and gate results are kept.
    pub async fn clear_cache(&self, paths: &[&str]) -> InstrResult<()> {
        let _session = self.tree.session.lock().await;
        for path in paths {
            let parsed = MemberPath::parse(path)?;
            self.clear_path_locked(parsed.segments())?;
        }
        debug!(node = %self.path, ?paths, "cache cleared");
        Ok(())
    }

    /// Forget every cached value of this node and its children.
    pub async fn clear_all(&self) {
        let _session = self.tree.session.lock().await;
        self.clear_all_locked();
    }

    /// Walk a member path, returning the owning node and member name.
    pub async fn resolve_path(self: &Arc<Self>, path: &str) -> InstrResult<(Arc<Node>, String)> {
        let parsed = MemberPath::parse(path)?;
        let Some((last, containers)) = parsed.segments().split_last() else {
            return Err(InstrError::InvalidPath {
                path: path.to_string(),
                message: "empty path".into(),
            });
        };
        if last.id.is_some() {
            return Err(InstrError::InvalidPath {
                path: path.to_string(),
                message: "path must end with a feature or action name".into(),
            });
        }
        let mut node = Arc::clone(self);
        for segment in containers {
            node = match &segment.id {
                Some(id) => node.channel(&segment.name, ChannelId::parse(id)).await?,
                None => node.subsystem(&segment.name).await?,
            };
        }
        Ok((node, last.name.clone()))
    }

    /// [`get`](Node::get) through a member path.
    pub async fn get_path(self: &Arc<Self>, path: &str) -> InstrResult<Value> {
        let (node, name) = self.resolve_path(path).await?;
        node.get(&name).await
    }

    /// [`set`](Node::set) through a member path.
    pub async fn set_path(self: &Arc<Self>, path: &str, value: impl Into<Value>) -> InstrResult<()> {
        let value = value.into();
        let (node, name) = self.resolve_path(path).await?;
        node.set(&name, value).await
    }

    /// [`invoke`](Node::invoke) through a member path.
    pub async fn invoke_path(self: &Arc<Self>, path: &str, args: &[Value]) -> InstrResult<Value> {
        let (node, name) = self.resolve_path(path).await?;
        node.invoke(&name, args).await
    }
}

// =============================================================================
// Member lookup
// =============================================================================

fn lookup<'s>(node: &Node, schema: &'s NodeSchema, name: &str) -> InstrResult<&'s Member> {
    schema.member(name).ok_or_else(|| InstrError::UnknownMember {
        node: node.path.clone(),
        member: name.to_string(),
    })
}

fn wrong_kind(node: &Node, name: &str, expected: &'static str) -> InstrError {
    InstrError::WrongMemberKind {
        node: node.path.clone(),
        member: name.to_string(),
        expected,
    }
}

fn feature_of<'s>(node: &Node, schema: &'s NodeSchema, name: &str) -> InstrResult<&'s FeatureDescriptor> {
    match lookup(node, schema, name)? {
        Member::Feature(f) => Ok(f),
        _ => Err(wrong_kind(node, name, "feature")),
    }
}

fn action_of<'s>(node: &Node, schema: &'s NodeSchema, name: &str) -> InstrResult<&'s ActionDescriptor> {
    match lookup(node, schema, name)? {
        Member::Action(a) => Ok(a),
        _ => Err(wrong_kind(node, name, "action")),
    }
}

fn subsystem_of<'s>(
    node: &Node,
    schema: &'s NodeSchema,
    name: &str,
) -> InstrResult<&'s SubsystemDescriptor> {
    match lookup(node, schema, name)? {
        Member::Subsystem(s) => Ok(s),
        _ => Err(wrong_kind(node, name, "subsystem")),
    }
}

fn channel_of<'s>(node: &Node, schema: &'s NodeSchema, name: &str) -> InstrResult<&'s ChannelDescriptor> {
    match lookup(node, schema, name)? {
        Member::Channel(c) => Ok(c),
        _ => Err(wrong_kind(node, name, "channel")),
    }
}

fn is_cacheable(feature: &FeatureDescriptor, options: &SessionOptions) -> bool {
    match feature.cache() {
        CachePolicy::None => false,
        _ => options.caching_allowed || feature.is_options(),
    }
}

/// Nearest node, starting at `node`, declaring the options feature `name`.
fn options_owner(node: &Arc<Node>, name: &str) -> InstrResult<Arc<Node>> {
    let mut current = Some(Arc::clone(node));
    while let Some(candidate) = current {
        if candidate.schema.has_options_feature(name) {
            return Ok(candidate);
        }
        current = candidate.parent.upgrade();
    }
    Err(InstrError::Declaration(format!(
        "{}: no options feature named '{}'",
        node.path, name
    )))
}

// =============================================================================
// Resolution (session held)
// =============================================================================

/// Evaluate a gate on `node`, at most once per node instance.
///
/// Failed evaluations (e.g. a timeout while reading options) are not
/// memoized.
fn ensure_gate<'a>(
    node: Arc<Node>,
    session: &'a mut Session,
    gate: &'a Gate,
    member: &'a str,
) -> BoxFuture<'a, InstrResult<()>> {
    async move {
        let memo = node.gate_result(gate.source());
        let pass = match memo {
            Some(pass) => pass,
            None => {
                let mut options = HashMap::new();
                for feature in gate.features() {
                    let owner = options_owner(&node, feature)?;
                    let value = get_feature(owner, &mut *session, feature).await?;
                    options.insert(feature.to_string(), value);
                }
                let pass = gate.evaluate(&options);
                node.state
                    .lock()
                    .gates
                    .insert(gate.source().to_string(), pass);
                debug!(node = %node.path, gate = %gate, pass, "gate evaluated");
                pass
            }
        };
        if pass {
            Ok(())
        } else {
            Err(InstrError::CapabilityUnavailable {
                member: member.to_string(),
                gate: gate.source().to_string(),
            })
        }
    }
    .boxed()
}

async fn run_checks(
    node: &Arc<Node>,
    session: &mut Session,
    checks: &[Arc<dyn Check>],
    input: CheckInput<'_>,
    member: &str,
) -> InstrResult<()> {
    for check in checks {
        let mut access = Access::new(Arc::clone(node), &mut *session);
        if !check.holds(&mut access, input).await? {
            return Err(InstrError::PreconditionFailed {
                member: member.to_string(),
                check: check.describe(),
            });
        }
    }
    Ok(())
}

pub(crate) fn get_feature<'a>(
    node: Arc<Node>,
    session: &'a mut Session,
    name: &'a str,
) -> BoxFuture<'a, InstrResult<Value>> {
    async move {
        node.ensure_attached()?;
        let schema = Arc::clone(&node.schema);
        let feature = feature_of(&node, &schema, name)?;
        let member = node.member_path(name);
        if let Some(alias) = feature.alias() {
            if let Some(gate) = feature.gate() {
                ensure_gate(Arc::clone(&node), &mut *session, gate, &member).await?;
            }
            run_checks(&node, &mut *session, feature.checks(), CheckInput::Get, &member).await?;
            let (owner, target) = alias_target(&node, &mut *session, alias).await?;
            debug!(member = %member, target = %alias.path, "alias read");
            return get_feature(owner, &mut *session, &target).await;
        }
        let getter = feature.getter().ok_or_else(|| InstrError::Unsupported {
            member: member.clone(),
            operation: "get",
        })?;

        if let Some(gate) = feature.gate() {
            ensure_gate(Arc::clone(&node), &mut *session, gate, &member).await?;
        }
        run_checks(&node, &mut *session, feature.checks(), CheckInput::Get, &member).await?;

        let cacheable = is_cacheable(feature, session.options());
        if cacheable {
            if let Some(value) = node.cached(name) {
                debug!(member = %member, "cache hit");
                return Ok(value);
            }
        }

        let command = substitute(&getter.resolve(&node.channel_context())?, None);
        let raw = session.query(&command, &member).await?;
        let value = feature
            .decode(&raw)
            .map_err(|message| InstrError::ResponseFormat {
                member: member.clone(),
                response: raw.trim().to_string(),
                message,
            })?;
        if cacheable {
            node.state.lock().cache.insert(
                name.to_string(),
                CacheEntry {
                    value: value.clone(),
                    fresh: true,
                },
            );
            debug!(member = %member, value = %value, "cache filled");
        }
        Ok(value)
    }
    .boxed()
}

pub(crate) fn set_feature<'a>(
    node: Arc<Node>,
    session: &'a mut Session,
    name: &'a str,
    value: Value,
) -> BoxFuture<'a, InstrResult<()>> {
    async move {
        node.ensure_attached()?;
        let schema = Arc::clone(&node.schema);
        let feature = feature_of(&node, &schema, name)?;
        let member = node.member_path(name);
        if let Some(alias) = feature.alias() {
            if !alias.settable {
                return Err(InstrError::Unsupported {
                    member,
                    operation: "set",
                });
            }
            if let Some(gate) = feature.gate() {
                ensure_gate(Arc::clone(&node), &mut *session, gate, &member).await?;
            }
            run_checks(
                &node,
                &mut *session,
                feature.checks(),
                CheckInput::Set(&value),
                &member,
            )
            .await?;
            let (owner, target) = alias_target(&node, &mut *session, alias).await?;
            debug!(member = %member, target = %alias.path, "alias write");
            return set_feature(owner, &mut *session, &target, value).await;
        }
        let setter = feature.setter().ok_or_else(|| InstrError::Unsupported {
            member: member.clone(),
            operation: "set",
        })?;

        let value = feature.validate(&member, &value)?;
        if let Some(gate) = feature.gate() {
            ensure_gate(Arc::clone(&node), &mut *session, gate, &member).await?;
        }
        run_checks(
            &node,
            &mut *session,
            feature.checks(),
            CheckInput::Set(&value),
            &member,
        )
        .await?;
        let value = match feature.named_limits() {
            Some(limits) => resolve_limits(Arc::clone(&node), &mut *session, limits)
                .await?
                .check(&member, &value)?,
            None => value,
        };

        let formatted = feature
            .encode(&value)
            .map_err(|message| InstrError::Validation {
                member: member.clone(),
                message,
            })?;
        let command = setter.resolve(&node.channel_context())?;
        session.write(&command, Some(&formatted), &member).await?;

        let cacheable = is_cacheable(feature, session.options());
        node.store_write(feature, value, cacheable);
        Ok(())
    }
    .boxed()
}

pub(crate) fn invoke_action<'a>(
    node: Arc<Node>,
    session: &'a mut Session,
    name: &'a str,
    args: &'a [Value],
) -> BoxFuture<'a, InstrResult<Value>> {
    async move {
        node.ensure_attached()?;
        let schema = Arc::clone(&node.schema);
        let action = action_of(&node, &schema, name)?;
        let member = node.member_path(name);

        let args = action.validate_args(&member, args)?;
        if let Some(gate) = action.gate() {
            ensure_gate(Arc::clone(&node), &mut *session, gate, &member).await?;
        }
        run_checks(
            &node,
            &mut *session,
            action.checks(),
            CheckInput::Invoke(&args),
            &member,
        )
        .await?;

        let raw = {
            let mut access = Access::new(Arc::clone(&node), &mut *session);
            action.operation().call(&mut access, &args).await?
        };
        action
            .returns()
            .convert(raw.clone())
            .map_err(|message| InstrError::ResponseFormat {
                member,
                response: raw.to_string(),
                message,
            })
    }
    .boxed()
}

pub(crate) fn resolve_subsystem<'a>(
    node: Arc<Node>,
    session: &'a mut Session,
    name: &'a str,
) -> BoxFuture<'a, InstrResult<Arc<Node>>> {
    async move {
        node.ensure_attached()?;
        let schema = Arc::clone(&node.schema);
        let desc = subsystem_of(&node, &schema, name)?;
        let member = node.member_path(name);
        if let Some(gate) = desc.gate() {
            ensure_gate(Arc::clone(&node), &mut *session, gate, &member).await?;
        }

        let mut state = node.state.lock();
        if let Some(existing) = state.subsystems.get(name) {
            return Ok(Arc::clone(existing));
        }
        let child = Node::child(&node, Arc::clone(desc.schema()), name.to_string(), None);
        state.subsystems.insert(name.to_string(), Arc::clone(&child));
        debug!(node = %child.path, "subsystem created");
        Ok(child)
    }
    .boxed()
}

pub(crate) fn resolve_channel<'a>(
    node: Arc<Node>,
    session: &'a mut Session,
    family: &'a str,
    key: ChannelId,
) -> BoxFuture<'a, InstrResult<Arc<Node>>> {
    async move {
        node.ensure_attached()?;
        let schema = Arc::clone(&node.schema);
        let desc = channel_of(&node, &schema, family)?;
        let member = node.member_path(family);
        if let Some(gate) = desc.gate() {
            ensure_gate(Arc::clone(&node), &mut *session, gate, &member).await?;
        }

        let id = desc.canonical(&key);
        let slot = (family.to_string(), id.clone());
        let existing = node.state.lock().channels.get(&slot).cloned();
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let valid = channel_ids(Arc::clone(&node), &mut *session, desc, family).await?;
        if !valid.contains(&id) {
            return Err(InstrError::UnknownChannelId {
                family: member,
                id: key.to_string(),
            });
        }

        let mut state = node.state.lock();
        let child = Arc::clone(state.channels.entry(slot).or_insert_with(|| {
            Node::child(
                &node,
                Arc::clone(desc.schema()),
                format!("{}[{}]", family, id),
                Some((family.to_string(), id.clone())),
            )
        }));
        debug!(node = %child.path, "channel created");
        Ok(child)
    }
    .boxed()
}

/// Named limits of `node`, resolved once and kept until discarded.
async fn resolve_limits(node: Arc<Node>, session: &mut Session, name: &str) -> InstrResult<Limits> {
    let cached = node.cached_limits(name);
    if let Some(limits) = cached {
        return Ok(limits);
    }
    let source = node.schema.limits(name).cloned().ok_or_else(|| {
        InstrError::Declaration(format!("{}: no limits named '{}'", node.path, name))
    })?;
    let limits = {
        let mut access = Access::new(Arc::clone(&node), &mut *session);
        source.limits(&mut access).await?
    };
    debug!(node = %node.path, limits = %name, range = %limits, "limits resolved");
    node.state.lock().limits.insert(name.to_string(), limits);
    Ok(limits)
}

/// Node and feature name an alias forwards to.
async fn alias_target(
    node: &Arc<Node>,
    session: &mut Session,
    alias: &AliasTarget,
) -> InstrResult<(Arc<Node>, String)> {
    let mut owner = Arc::clone(node);
    for _ in 0..alias.path.levels() {
        owner = owner.parent().ok_or_else(|| InstrError::Detached {
            node: node.path.clone(),
        })?;
    }
    let Some((last, containers)) = alias.path.path().segments().split_last() else {
        return Err(InstrError::InvalidPath {
            path: alias.path.to_string(),
            message: "empty path".into(),
        });
    };
    for segment in containers {
        owner = match &segment.id {
            Some(id) => {
                resolve_channel(owner, &mut *session, &segment.name, ChannelId::parse(id)).await?
            }
            None => resolve_subsystem(owner, &mut *session, &segment.name).await?,
        };
    }
    Ok((owner, last.name.clone()))
}

async fn channel_ids(
    node: Arc<Node>,
    session: &mut Session,
    desc: &ChannelDescriptor,
    family: &str,
) -> InstrResult<Vec<ChannelId>> {
    let action = match desc.ids() {
        IdSource::Static(ids) => return Ok(ids.clone()),
        IdSource::Listed(action) => action,
    };
    let cached = node.state.lock().channel_ids.get(family).cloned();
    if let Some(ids) = cached {
        return Ok(ids);
    }

    let listed = invoke_action(Arc::clone(&node), session, action, &[]).await?;
    let items: Vec<Value> = match &listed {
        Value::List(items) => items.clone(),
        Value::Str(text) => text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Value::parse_literal)
            .collect(),
        other => vec![other.clone()],
    };
    let ids = items
        .iter()
        .map(ChannelId::from_value)
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| InstrError::ResponseFormat {
            member: node.member_path(action),
            response: listed.to_string(),
            message: "not a list of channel ids".into(),
        })?;
    debug!(node = %node.path, family, ?ids, "channel ids listed");
    node.state
        .lock()
        .channel_ids
        .insert(family.to_string(), ids.clone());
    Ok(ids)
}

// =============================================================================
// Driver
// =============================================================================

/// Handle owning the root node of a driver tree.
///
/// Dereferences to the root `Arc<Node>`, so `driver.get("idn")` reads a
/// root feature. Dropping the driver drops the tree; child nodes kept
/// elsewhere then fail with [`InstrError::Detached`].
#[derive(Debug)]
pub struct Driver {
    root: Arc<Node>,
}

impl Driver {
    /// Instantiate `schema` on top of `backend`.
    pub fn open(
        schema: Arc<DriverSchema>,
        backend: Box<dyn BackendAdapter>,
        options: SessionOptions,
    ) -> Self {
        info!(
            driver = %schema.name(),
            timeout_ms = options.timeout.as_millis() as u64,
            caching = options.caching_allowed,
            "driver opened"
        );
        let session = Session::new(backend, options, schema.ack().clone());
        let tree = Arc::new(Tree {
            session: tokio::sync::Mutex::new(session),
            driver: Arc::clone(&schema),
        });
        let root = Arc::new(Node {
            schema: Arc::clone(schema.root()),
            parent: Weak::new(),
            tree,
            path: schema.name().to_string(),
            channel: None,
            is_root: true,
            state: Mutex::new(NodeState::default()),
        });
        Self { root }
    }

    /// Root node of the tree.
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Compiled driver declaration.
    pub fn schema(&self) -> &Arc<DriverSchema> {
        &self.root.tree.driver
    }

    /// Number of backend calls issued so far.
    pub async fn exchange_count(&self) -> u64 {
        self.root.tree.session.lock().await.exchange_count()
    }

    /// Close the backend and drop the tree.
    pub async fn close(self) -> InstrResult<()> {
        let mut session = self.root.tree.session.lock().await;
        session.close().await?;
        info!(driver = %self.root.path, "driver closed");
        Ok(())
    }
}

impl Deref for Driver {
    type Target = Arc<Node>;

    fn deref(&self) -> &Self::Target {
        &self.root
    }
}
