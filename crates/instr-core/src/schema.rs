//! Driver schema declaration.
//!
//! A driver is declared once as a tree of members: features, actions,
//! subsystems and channel families. [`DriverBuilder::build`] parses every
//! command template and gate, checks cross references and produces an
//! immutable [`DriverSchema`] shared by all instances of the driver.
//!
//! # Example
//!
//! ```rust,ignore
//! use instr_core::prelude::*;
//!
//! let schema = DriverSchema::builder("FG")
//!     .ack(AckPolicy::expect("OK"))
//!     .feature(Feature::options("opt", "*OPT?"))
//!     .feature(
//!         Feature::new("frequency")
//!             .getter("FREQ?")
//!             .setter("FREQ {:.2f}")
//!             .float(FloatLimits::range(1.0, 100_000.0)?)
//!             .dependents(["waveform"]),
//!     )
//!     .feature(
//!         Feature::new("waveform")
//!             .getter("FUNC?")
//!             .setter("FUNC {}")
//!             .mapping(Mapping::symmetric([("sine", "SIN"), ("square", "SQU")])),
//!     )
//!     .build()?;
//!
//! // Derived model with a wider frequency range
//! let fg200 = schema
//!     .derive("FG200")
//!     .override_feature(
//!         "frequency",
//!         FeatureOverride::new().validator(Validator::Float(Some(FloatLimits::range(1.0, 200_000.0)?))),
//!     )
//!     .build()?;
//! ```

use crate::action::Operation;
use crate::check::Check;
use crate::convert::{encode_typed, parse_typed, Extract, Mapping, OptionsFormat};
use crate::error::{InstrError, InstrResult};
use crate::gate::Gate;
use crate::named_limits::LimitsSource;
use crate::path::RelativePath;
use crate::session::AckPolicy;
use crate::template::CommandTemplate;
use crate::validator::{FloatLimits, IntLimits, Validator};
use crate::value::{ChannelId, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

// =============================================================================
// Cache Policy
// =============================================================================

/// How long a feature value is trusted once read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    /// Never cached: every read queries the instrument.
    None,
    /// Cached until the node is dropped. Survives dependents and cache
    /// clearing.
    InstanceLifetime,
    /// Cached until a dependent write or an explicit cache clear.
    #[default]
    UntilInvalidated,
}

// =============================================================================
// Declarations
// =============================================================================

/// Declaration of a cached attribute.
#[derive(Debug, Clone)]
pub struct Feature {
    name: String,
    getter: Option<String>,
    setter: Option<String>,
    validator: Validator,
    extract: Option<String>,
    mapping: Option<Mapping>,
    options_format: Option<OptionsFormat>,
    cache: CachePolicy,
    dependents: Vec<String>,
    gate: Option<String>,
    checks: Vec<Arc<dyn Check>>,
    named_limits: Option<String>,
    discard_limits: Vec<String>,
    alias: Option<(String, bool)>,
}

impl Feature {
    /// Feature with no accessors yet; add a getter, a setter or both.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            getter: None,
            setter: None,
            validator: Validator::Any,
            extract: None,
            mapping: None,
            options_format: None,
            cache: CachePolicy::default(),
            dependents: Vec::new(),
            gate: None,
            checks: Vec::new(),
            named_limits: None,
            discard_limits: Vec::new(),
            alias: None,
        }
    }

    /// Uncached forward to another feature, addressed relative to this
    /// node (leading dots climb to parents, e.g. `.frequency`).
    pub fn alias(name: impl Into<String>, target: impl Into<String>, settable: bool) -> Self {
        Self {
            alias: Some((target.into(), settable)),
            cache: CachePolicy::None,
            ..Self::new(name)
        }
    }

    /// Read-only options mapping, queried once per node instance.
    pub fn options(name: impl Into<String>, getter: impl Into<String>) -> Self {
        Self {
            getter: Some(getter.into()),
            validator: Validator::Options,
            options_format: Some(OptionsFormat::default()),
            cache: CachePolicy::InstanceLifetime,
            ..Self::new(name)
        }
    }

    /// Declared name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Query template used by `get`.
    pub fn getter(mut self, template: impl Into<String>) -> Self {
        self.getter = Some(template.into());
        self
    }

    /// Write template used by `set`, with one value placeholder.
    pub fn setter(mut self, template: impl Into<String>) -> Self {
        self.setter = Some(template.into());
        self
    }

    /// Replace the validator.
    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    /// Boolean value.
    pub fn boolean(self) -> Self {
        self.validator(Validator::Bool)
    }

    /// Free text value.
    pub fn text(self) -> Self {
        self.validator(Validator::Text)
    }

    /// Bounded integer value.
    pub fn int(self, limits: IntLimits) -> Self {
        self.validator(Validator::Int(Some(limits)))
    }

    /// Bounded float value.
    pub fn float(self, limits: FloatLimits) -> Self {
        self.validator(Validator::Float(Some(limits)))
    }

    /// Value restricted to an enumerated set.
    pub fn one_of<V: Into<Value>>(self, values: impl IntoIterator<Item = V>) -> Self {
        self.validator(Validator::OneOf(
            values.into_iter().map(Into::into).collect(),
        ))
    }

    /// Bit field with one name per bit, least significant first.
    pub fn register<S: Into<String>>(self, bits: impl IntoIterator<Item = S>) -> Self {
        self.validator(Validator::Register(
            bits.into_iter().map(Into::into).collect(),
        ))
    }

    /// Regex applied to responses; the first capture group (or the whole
    /// match) is decoded.
    pub fn extract(mut self, pattern: impl Into<String>) -> Self {
        self.extract = Some(pattern.into());
        self
    }

    /// Value translation table.
    pub fn mapping(mut self, mapping: Mapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    /// Parser for options replies.
    pub fn options_format(mut self, format: OptionsFormat) -> Self {
        self.options_format = Some(format);
        self
    }

    /// Options features only accept [`CachePolicy::InstanceLifetime`].
    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = policy;
        self
    }

    /// Features of the same node staled by a successful write of this one.
    pub fn dependents<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.dependents = names.into_iter().map(Into::into).collect();
        self
    }

    /// Options gate guarding every access.
    pub fn gate(mut self, expression: impl Into<String>) -> Self {
        self.gate = Some(expression.into());
        self
    }

    /// Precondition run after the gate.
    pub fn check(mut self, check: impl Check + 'static) -> Self {
        self.checks.push(Arc::new(check));
        self
    }

    /// Validate writes against limits declared on the node under `name`.
    pub fn limits(mut self, name: impl Into<String>) -> Self {
        self.named_limits = Some(name.into());
        self
    }

    /// Named limits of the same node dropped by a successful write.
    pub fn discard_limits<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.discard_limits = names.into_iter().map(Into::into).collect();
        self
    }

    fn is_options(&self) -> bool {
        self.validator == Validator::Options
    }
}

/// How the raw result of an action's operation is converted.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Returns {
    /// Returned as produced by the operation.
    #[default]
    Raw,
    /// Text parsed as a single value of the validator's type.
    Parsed(Validator),
    /// Text split on `separator`, each item parsed.
    List {
        /// Item separator.
        separator: char,
        /// Type of each item.
        item: Validator,
    },
}

impl Returns {
    /// Comma separated list of items.
    pub fn list_of(item: Validator) -> Self {
        Returns::List {
            separator: ',',
            item,
        }
    }

    pub(crate) fn convert(&self, value: Value) -> Result<Value, String> {
        let text = match (self, value) {
            (Returns::Raw, value) => return Ok(value),
            (_, Value::Str(text)) => text,
            (_, other) => return Ok(other),
        };
        let text = text.trim();
        match self {
            Returns::Raw => Ok(Value::Str(text.to_string())),
            Returns::Parsed(validator) => parse_typed(validator, text),
            Returns::List { separator, item } => text
                .split(*separator)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_typed(item, s))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
        }
    }
}

/// Declaration of an invokable operation.
#[derive(Debug, Clone)]
pub struct Action {
    name: String,
    args: Vec<(String, Validator)>,
    operation: Arc<dyn Operation>,
    returns: Returns,
    gate: Option<String>,
    checks: Vec<Arc<dyn Check>>,
}

impl Action {
    /// Action backed by `operation`.
    pub fn new(name: impl Into<String>, operation: impl Operation + 'static) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            operation: Arc::new(operation),
            returns: Returns::Raw,
            gate: None,
            checks: Vec::new(),
        }
    }

    /// Declared name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a validated argument.
    pub fn arg(mut self, name: impl Into<String>, validator: Validator) -> Self {
        self.args.push((name.into(), validator));
        self
    }

    /// Conversion of the operation result.
    pub fn returns(mut self, returns: Returns) -> Self {
        self.returns = returns;
        self
    }

    /// Options gate guarding the action.
    pub fn gate(mut self, expression: impl Into<String>) -> Self {
        self.gate = Some(expression.into());
        self
    }

    /// Precondition run after the gate.
    pub fn check(mut self, check: impl Check + 'static) -> Self {
        self.checks.push(Arc::new(check));
        self
    }
}

/// Declaration of a named singleton child node.
#[derive(Debug, Clone)]
pub struct Subsystem {
    name: String,
    node: NodeDecl,
    gate: Option<String>,
}

impl Subsystem {
    /// Subsystem with the members of `node`.
    pub fn new(name: impl Into<String>, node: NodeDecl) -> Self {
        Self {
            name: name.into(),
            node,
            gate: None,
        }
    }

    /// Options gate guarding access to the subsystem.
    pub fn gate(mut self, expression: impl Into<String>) -> Self {
        self.gate = Some(expression.into());
        self
    }
}

/// Where the valid ids of a channel family come from.
#[derive(Debug, Clone, PartialEq)]
pub enum IdSource {
    /// Fixed list.
    Static(Vec<ChannelId>),
    /// Result of a zero-argument action on the parent node, run at most
    /// once per parent instance.
    Listed(String),
}

/// Declaration of an id-indexed family of child nodes.
#[derive(Debug, Clone)]
pub struct Channel {
    name: String,
    node: NodeDecl,
    ids: Option<IdSource>,
    aliases: Vec<(String, ChannelId)>,
    gate: Option<String>,
}

impl Channel {
    /// Channel family with the members of `node`. Ids come from [`ids`](Self::ids) or [`listed_by`](Self::listed_by).
    pub fn new(name: impl Into<String>, node: NodeDecl) -> Self {
        Self {
            name: name.into(),
            node,
            ids: None,
            aliases: Vec::new(),
            gate: None,
        }
    }

    /// Fixed set of valid ids.
    pub fn ids<I: Into<ChannelId>>(mut self, ids: impl IntoIterator<Item = I>) -> Self {
        self.ids = Some(IdSource::Static(ids.into_iter().map(Into::into).collect()));
        self
    }

    /// Take the valid ids from an action declared on the parent node.
    pub fn listed_by(mut self, action: impl Into<String>) -> Self {
        self.ids = Some(IdSource::Listed(action.into()));
        self
    }

    /// Extra name resolving to `id`.
    pub fn alias(mut self, alias: impl Into<String>, id: impl Into<ChannelId>) -> Self {
        self.aliases.push((alias.into(), id.into()));
        self
    }

    /// Options gate guarding the family.
    pub fn gate(mut self, expression: impl Into<String>) -> Self {
        self.gate = Some(expression.into());
        self
    }
}

/// One declared member.
#[derive(Debug, Clone)]
pub enum MemberDecl {
    /// A feature.
    Feature(Feature),
    /// An action.
    Action(Action),
    /// A subsystem.
    Subsystem(Subsystem),
    /// A channel family.
    Channel(Channel),
}

impl MemberDecl {
    fn name(&self) -> &str {
        match self {
            MemberDecl::Feature(f) => &f.name,
            MemberDecl::Action(a) => &a.name,
            MemberDecl::Subsystem(s) => &s.name,
            MemberDecl::Channel(c) => &c.name,
        }
    }
}

/// Members of one node type, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct NodeDecl {
    members: Vec<MemberDecl>,
    limits: Vec<(String, Arc<dyn LimitsSource>)>,
}

impl NodeDecl {
    /// Empty node type.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare named limits computed at runtime.
    pub fn limits(mut self, name: impl Into<String>, source: impl LimitsSource + 'static) -> Self {
        self.upsert_limits(name.into(), Arc::new(source));
        self
    }

    fn upsert_limits(&mut self, name: String, source: Arc<dyn LimitsSource>) {
        match self.limits.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = source,
            None => self.limits.push((name, source)),
        }
    }

    /// Add or replace a feature.
    pub fn feature(mut self, feature: Feature) -> Self {
        self.members.push(MemberDecl::Feature(feature));
        self
    }

    /// Add or replace an action.
    pub fn action(mut self, action: Action) -> Self {
        self.members.push(MemberDecl::Action(action));
        self
    }

    /// Add or replace a subsystem.
    pub fn subsystem(mut self, subsystem: Subsystem) -> Self {
        self.members.push(MemberDecl::Subsystem(subsystem));
        self
    }

    /// Add or replace a channel family.
    pub fn channel(mut self, channel: Channel) -> Self {
        self.members.push(MemberDecl::Channel(channel));
        self
    }

    /// Add or replace a member by name.
    fn upsert(&mut self, member: MemberDecl) {
        match self.members.iter_mut().find(|m| m.name() == member.name()) {
            Some(slot) => *slot = member,
            None => self.members.push(member),
        }
    }

    /// Walk a dotted declaration path (`trigger.level`, `output.offset`).
    fn find_mut(&mut self, path: &str) -> Option<&mut MemberDecl> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let member = self.members.iter_mut().find(|m| m.name() == head)?;
        match (rest, member) {
            (None, member) => Some(member),
            (Some(rest), MemberDecl::Subsystem(s)) => s.node.find_mut(rest),
            (Some(rest), MemberDecl::Channel(c)) => c.node.find_mut(rest),
            _ => None,
        }
    }
}

// =============================================================================
// Overrides
// =============================================================================

/// Replacement of selected fields of an inherited feature.
#[derive(Debug, Clone, Default)]
pub struct FeatureOverride {
    getter: Option<Option<String>>,
    setter: Option<Option<String>>,
    validator: Option<Validator>,
    extract: Option<Option<String>>,
    mapping: Option<Option<Mapping>>,
    cache: Option<CachePolicy>,
    dependents: Option<Vec<String>>,
    gate: Option<Option<String>>,
    checks: Option<Vec<Arc<dyn Check>>>,
    named_limits: Option<Option<String>>,
    discard_limits: Option<Vec<String>>,
}

impl FeatureOverride {
    /// Override replacing nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the getter, `None` removes it.
    pub fn getter(mut self, template: Option<&str>) -> Self {
        self.getter = Some(template.map(str::to_string));
        self
    }

    /// Replace the setter, `None` removes it.
    pub fn setter(mut self, template: Option<&str>) -> Self {
        self.setter = Some(template.map(str::to_string));
        self
    }

    /// Replace the validator.
    pub fn validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Replace the extract pattern.
    pub fn extract(mut self, pattern: Option<&str>) -> Self {
        self.extract = Some(pattern.map(str::to_string));
        self
    }

    /// Replace the value mapping.
    pub fn mapping(mut self, mapping: Option<Mapping>) -> Self {
        self.mapping = Some(mapping);
        self
    }

    /// Replace the cache policy.
    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    /// Replace the dependents.
    pub fn dependents<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.dependents = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Replace the gate, `None` removes it.
    pub fn gate(mut self, expression: Option<&str>) -> Self {
        self.gate = Some(expression.map(str::to_string));
        self
    }

    /// Replace all inherited checks.
    pub fn checks(mut self, checks: Vec<Arc<dyn Check>>) -> Self {
        self.checks = Some(checks);
        self
    }

    /// Replace the named limits, `None` removes them.
    pub fn limits(mut self, name: Option<&str>) -> Self {
        self.named_limits = Some(name.map(str::to_string));
        self
    }

    /// Replace the discarded limits.
    pub fn discard_limits<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.discard_limits = Some(names.into_iter().map(Into::into).collect());
        self
    }

    fn apply(&self, feature: &mut Feature) {
        if let Some(v) = &self.getter {
            feature.getter = v.clone();
        }
        if let Some(v) = &self.setter {
            feature.setter = v.clone();
        }
        if let Some(v) = &self.validator {
            feature.validator = v.clone();
        }
        if let Some(v) = &self.extract {
            feature.extract = v.clone();
        }
        if let Some(v) = &self.mapping {
            feature.mapping = v.clone();
        }
        if let Some(v) = self.cache {
            feature.cache = v;
        }
        if let Some(v) = &self.dependents {
            feature.dependents = v.clone();
        }
        if let Some(v) = &self.gate {
            feature.gate = v.clone();
        }
        if let Some(v) = &self.checks {
            feature.checks = v.clone();
        }
        if let Some(v) = &self.named_limits {
            feature.named_limits = v.clone();
        }
        if let Some(v) = &self.discard_limits {
            feature.discard_limits = v.clone();
        }
    }
}

/// Replacement of selected fields of an inherited action.
#[derive(Debug, Clone, Default)]
pub struct ActionOverride {
    operation: Option<Arc<dyn Operation>>,
    returns: Option<Returns>,
    gate: Option<Option<String>>,
    checks: Option<Vec<Arc<dyn Check>>>,
}

impl ActionOverride {
    /// Override replacing nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the operation.
    pub fn operation(mut self, operation: impl Operation + 'static) -> Self {
        self.operation = Some(Arc::new(operation));
        self
    }

    /// Replace the result conversion.
    pub fn returns(mut self, returns: Returns) -> Self {
        self.returns = Some(returns);
        self
    }

    /// Replace the gate, `None` removes it.
    pub fn gate(mut self, expression: Option<&str>) -> Self {
        self.gate = Some(expression.map(str::to_string));
        self
    }

    /// Replace all inherited checks.
    pub fn checks(mut self, checks: Vec<Arc<dyn Check>>) -> Self {
        self.checks = Some(checks);
        self
    }

    fn apply(&self, action: &mut Action) {
        if let Some(v) = &self.operation {
            action.operation = v.clone();
        }
        if let Some(v) = &self.returns {
            action.returns = v.clone();
        }
        if let Some(v) = &self.gate {
            action.gate = v.clone();
        }
        if let Some(v) = &self.checks {
            action.checks = v.clone();
        }
    }
}

// =============================================================================
// Compiled descriptors
// =============================================================================

/// Compiled feature, shared by every node of its type.
#[derive(Debug)]
pub struct FeatureDescriptor {
    name: String,
    getter: Option<CommandTemplate>,
    setter: Option<CommandTemplate>,
    validator: Validator,
    extract: Option<Extract>,
    mapping: Option<Mapping>,
    options_format: Option<OptionsFormat>,
    cache: CachePolicy,
    dependents: Vec<String>,
    gate: Option<Gate>,
    checks: Vec<Arc<dyn Check>>,
    named_limits: Option<String>,
    discard_limits: Vec<String>,
    alias: Option<AliasTarget>,
}

/// Target of an alias feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasTarget {
    /// Path of the aliased feature, relative to the alias' node.
    pub path: RelativePath,
    /// Whether writes are forwarded.
    pub settable: bool,
}

impl FeatureDescriptor {
    /// Declared name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Query template.
    pub fn getter(&self) -> Option<&CommandTemplate> {
        self.getter.as_ref()
    }

    /// Write template.
    pub fn setter(&self) -> Option<&CommandTemplate> {
        self.setter.as_ref()
    }

    /// Validator applied to written values.
    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Cache policy.
    pub fn cache(&self) -> CachePolicy {
        self.cache
    }

    /// Features staled by a write.
    pub fn dependents(&self) -> &[String] {
        &self.dependents
    }

    /// Options gate.
    pub fn gate(&self) -> Option<&Gate> {
        self.gate.as_ref()
    }

    /// Preconditions.
    pub fn checks(&self) -> &[Arc<dyn Check>] {
        &self.checks
    }

    /// Name of the node limits validating writes.
    pub fn named_limits(&self) -> Option<&str> {
        self.named_limits.as_deref()
    }

    /// Named limits dropped by a successful write.
    pub fn discard_limits(&self) -> &[String] {
        &self.discard_limits
    }

    /// Forwarding target when this feature is an alias.
    pub fn alias(&self) -> Option<&AliasTarget> {
        self.alias.as_ref()
    }

    /// Whether this is an options mapping feature.
    pub fn is_options(&self) -> bool {
        self.options_format.is_some()
    }

    /// Validate a value about to be written.
    pub fn validate(&self, member: &str, value: &Value) -> InstrResult<Value> {
        let value = self.validator.validate(member, value)?;
        if let Some(mapping) = &self.mapping {
            if mapping.to_device(&value).is_none() {
                return Err(InstrError::Validation {
                    member: member.to_string(),
                    message: format!("{} has no device representation", value),
                });
            }
        }
        Ok(value)
    }

    /// Convert a raw response into a value.
    pub fn decode(&self, raw: &str) -> Result<Value, String> {
        let text = match &self.extract {
            Some(extract) => extract
                .apply(raw)
                .ok_or_else(|| format!("does not match '{}'", extract.as_str()))?,
            None => raw,
        };
        if let Some(format) = &self.options_format {
            return format.decode(text);
        }
        if let Some(mapping) = &self.mapping {
            return mapping
                .from_device(text)
                .cloned()
                .ok_or_else(|| "not a known device value".to_string());
        }
        parse_typed(&self.validator, text)
    }

    /// Format a validated value for the set template.
    pub fn encode(&self, value: &Value) -> Result<String, String> {
        let wire = match &self.mapping {
            Some(mapping) => Value::Str(
                mapping
                    .to_device(value)
                    .ok_or_else(|| format!("{} has no device representation", value))?
                    .to_string(),
            ),
            None => encode_typed(&self.validator, value)?,
        };
        match &self.setter {
            Some(setter) => setter.format_value(&wire),
            None => Ok(wire.to_string()),
        }
    }
}

/// Compiled action.
#[derive(Debug)]
pub struct ActionDescriptor {
    name: String,
    args: Vec<(String, Validator)>,
    operation: Arc<dyn Operation>,
    returns: Returns,
    gate: Option<Gate>,
    checks: Vec<Arc<dyn Check>>,
}

impl ActionDescriptor {
    /// Declared name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arguments and their validators.
    pub fn args(&self) -> &[(String, Validator)] {
        &self.args
    }

    /// Operation run on invoke.
    pub fn operation(&self) -> &Arc<dyn Operation> {
        &self.operation
    }

    /// Result conversion.
    pub fn returns(&self) -> &Returns {
        &self.returns
    }

    /// Options gate.
    pub fn gate(&self) -> Option<&Gate> {
        self.gate.as_ref()
    }

    /// Preconditions.
    pub fn checks(&self) -> &[Arc<dyn Check>] {
        &self.checks
    }

    /// Validate call arguments, returning them normalized.
    pub fn validate_args(&self, member: &str, args: &[Value]) -> InstrResult<Vec<Value>> {
        if args.len() != self.args.len() {
            return Err(InstrError::Validation {
                member: member.to_string(),
                message: format!(
                    "expected {} argument(s), got {}",
                    self.args.len(),
                    args.len()
                ),
            });
        }
        self.args
            .iter()
            .zip(args)
            .map(|((name, validator), arg)| {
                validator.validate(&format!("{}({})", member, name), arg)
            })
            .collect()
    }
}

/// Compiled subsystem.
#[derive(Debug)]
pub struct SubsystemDescriptor {
    name: String,
    gate: Option<Gate>,
    schema: Arc<NodeSchema>,
}

impl SubsystemDescriptor {
    /// Declared name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options gate.
    pub fn gate(&self) -> Option<&Gate> {
        self.gate.as_ref()
    }

    /// Node type of the subsystem.
    pub fn schema(&self) -> &Arc<NodeSchema> {
        &self.schema
    }
}

/// Compiled channel family.
#[derive(Debug)]
pub struct ChannelDescriptor {
    name: String,
    gate: Option<Gate>,
    schema: Arc<NodeSchema>,
    ids: IdSource,
    aliases: HashMap<String, ChannelId>,
}

impl ChannelDescriptor {
    /// Family name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options gate.
    pub fn gate(&self) -> Option<&Gate> {
        self.gate.as_ref()
    }

    /// Node type of every instance.
    pub fn schema(&self) -> &Arc<NodeSchema> {
        &self.schema
    }

    /// Where valid ids come from.
    pub fn ids(&self) -> &IdSource {
        &self.ids
    }

    /// Id aliases.
    pub fn aliases(&self) -> &HashMap<String, ChannelId> {
        &self.aliases
    }

    /// Resolve an alias; numeric names become indices.
    pub fn canonical(&self, key: &ChannelId) -> ChannelId {
        match key {
            ChannelId::Name(name) => match self.aliases.get(name) {
                Some(id) => id.clone(),
                None => ChannelId::parse(name),
            },
            index => index.clone(),
        }
    }
}

/// A compiled member.
#[derive(Debug)]
pub enum Member {
    /// A feature.
    Feature(FeatureDescriptor),
    /// An action.
    Action(ActionDescriptor),
    /// A subsystem.
    Subsystem(SubsystemDescriptor),
    /// A channel family.
    Channel(ChannelDescriptor),
}

impl Member {
    /// Lowercase kind name, for messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Member::Feature(_) => "feature",
            Member::Action(_) => "action",
            Member::Subsystem(_) => "subsystem",
            Member::Channel(_) => "channel",
        }
    }
}

/// Compiled node type.
#[derive(Debug)]
pub struct NodeSchema {
    name: String,
    members: BTreeMap<String, Member>,
    order: Vec<String>,
    limits: BTreeMap<String, Arc<dyn LimitsSource>>,
}

impl NodeSchema {
    /// Declaration path of the node type, e.g. `SIM-FG100.output`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Member by name.
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    /// Member names in declaration order.
    pub fn member_names(&self) -> &[String] {
        &self.order
    }

    /// Feature by name.
    pub fn feature(&self, name: &str) -> Option<&FeatureDescriptor> {
        match self.members.get(name) {
            Some(Member::Feature(f)) => Some(f),
            _ => None,
        }
    }

    /// Action by name.
    pub fn action(&self, name: &str) -> Option<&ActionDescriptor> {
        match self.members.get(name) {
            Some(Member::Action(a)) => Some(a),
            _ => None,
        }
    }

    /// Subsystem by name.
    pub fn subsystem(&self, name: &str) -> Option<&SubsystemDescriptor> {
        match self.members.get(name) {
            Some(Member::Subsystem(s)) => Some(s),
            _ => None,
        }
    }

    /// Channel family by name.
    pub fn channel(&self, name: &str) -> Option<&ChannelDescriptor> {
        match self.members.get(name) {
            Some(Member::Channel(c)) => Some(c),
            _ => None,
        }
    }

    /// Source of the named limits `name`.
    pub fn limits(&self, name: &str) -> Option<&Arc<dyn LimitsSource>> {
        self.limits.get(name)
    }

    /// Names of the declared limits.
    pub fn limit_names(&self) -> impl Iterator<Item = &str> {
        self.limits.keys().map(String::as_str)
    }

    /// Whether `name` is an options feature of this node type.
    pub fn has_options_feature(&self, name: &str) -> bool {
        self.feature(name).is_some_and(FeatureDescriptor::is_options)
    }

    fn describe_into(&self, out: &mut String, depth: usize) {
        for name in &self.order {
            let Some(member) = self.members.get(name) else {
                continue;
            };
            let indent = "  ".repeat(depth);
            let _ = match member {
                Member::Feature(f) => match &f.alias {
                    Some(alias) => {
                        let access = if alias.settable { "rw" } else { "r" };
                        writeln!(out, "{}{} [alias, {}] -> {}", indent, name, access, alias.path)
                    }
                    None => {
                        let access = match (f.getter.is_some(), f.setter.is_some()) {
                            (true, true) => "rw",
                            (true, false) => "r",
                            _ => "w",
                        };
                        writeln!(out, "{}{} [feature, {}]", indent, name, access)
                    }
                },
                Member::Action(a) => {
                    let args: Vec<&str> = a.args.iter().map(|(n, _)| n.as_str()).collect();
                    writeln!(out, "{}{}({}) [action]", indent, name, args.join(", "))
                }
                Member::Subsystem(_) => writeln!(out, "{}{} [subsystem]", indent, name),
                Member::Channel(c) => {
                    let ids = match &c.ids {
                        IdSource::Static(ids) => ids
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", "),
                        IdSource::Listed(action) => format!("ids from {}", action),
                    };
                    writeln!(out, "{}{}[{}] [channel]", indent, name, ids)
                }
            };
            match member {
                Member::Subsystem(s) => s.schema.describe_into(out, depth + 1),
                Member::Channel(c) => c.schema.describe_into(out, depth + 1),
                _ => {}
            }
        }
    }
}

// =============================================================================
// Driver schema
// =============================================================================

/// Immutable schema of a driver class.
#[derive(Debug)]
pub struct DriverSchema {
    name: String,
    ack: AckPolicy,
    root: Arc<NodeSchema>,
    declaration: DriverBuilder,
}

impl DriverSchema {
    /// Start declaring a driver.
    pub fn builder(name: impl Into<String>) -> DriverBuilder {
        DriverBuilder {
            name: name.into(),
            ack: AckPolicy::default(),
            root: NodeDecl::new(),
            problems: Vec::new(),
        }
    }

    /// Driver name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How writes are confirmed.
    pub fn ack(&self) -> &AckPolicy {
        &self.ack
    }

    /// Root node type.
    pub fn root(&self) -> &Arc<NodeSchema> {
        &self.root
    }

    /// Copy this declaration under a new name, ready for overrides.
    pub fn derive(&self, name: impl Into<String>) -> DriverBuilder {
        DriverBuilder {
            name: name.into(),
            ..self.declaration.clone()
        }
    }

    /// Indented listing of the member tree.
    pub fn describe(&self) -> String {
        let mut out = format!("{}\n", self.name);
        self.root.describe_into(&mut out, 1);
        out
    }
}

/// Mutable driver declaration, turned into a [`DriverSchema`] by
/// [`build`](DriverBuilder::build).
#[derive(Debug, Clone)]
pub struct DriverBuilder {
    name: String,
    ack: AckPolicy,
    root: NodeDecl,
    problems: Vec<String>,
}

impl DriverBuilder {
    /// How writes are confirmed.
    pub fn ack(mut self, policy: AckPolicy) -> Self {
        self.ack = policy;
        self
    }

    /// Declare named limits on the root node.
    pub fn limits(mut self, name: impl Into<String>, source: impl LimitsSource + 'static) -> Self {
        self.root.upsert_limits(name.into(), Arc::new(source));
        self
    }

    /// Replace or add named limits, addressed as `name` on the root or
    /// `container.name` inside a subsystem or channel.
    pub fn override_limits(mut self, path: &str, source: impl LimitsSource + 'static) -> Self {
        let source: Arc<dyn LimitsSource> = Arc::new(source);
        match path.rsplit_once('.') {
            None => self.root.upsert_limits(path.to_string(), source),
            Some((container, name)) => match self.root.find_mut(container) {
                Some(MemberDecl::Subsystem(s)) => s.node.upsert_limits(name.to_string(), source),
                Some(MemberDecl::Channel(c)) => c.node.upsert_limits(name.to_string(), source),
                _ => self
                    .problems
                    .push(format!("'{}' is not a subsystem or channel", container)),
            },
        }
        self
    }

    /// Add or replace a root feature.
    pub fn feature(mut self, feature: Feature) -> Self {
        self.root.upsert(MemberDecl::Feature(feature));
        self
    }

    /// Add or replace a root action.
    pub fn action(mut self, action: Action) -> Self {
        self.root.upsert(MemberDecl::Action(action));
        self
    }

    /// Add or replace a subsystem.
    pub fn subsystem(mut self, subsystem: Subsystem) -> Self {
        self.root.upsert(MemberDecl::Subsystem(subsystem));
        self
    }

    /// Add or replace a channel family.
    pub fn channel(mut self, channel: Channel) -> Self {
        self.root.upsert(MemberDecl::Channel(channel));
        self
    }

    /// Add a member inside an inherited subsystem or channel (`path` names
    /// the container, e.g. `trigger`).
    pub fn add_to(mut self, path: &str, member: MemberDecl) -> Self {
        match self.root.find_mut(path) {
            Some(MemberDecl::Subsystem(s)) => s.node.upsert(member),
            Some(MemberDecl::Channel(c)) => c.node.upsert(member),
            _ => self
                .problems
                .push(format!("'{}' is not a subsystem or channel", path)),
        }
        self
    }

    /// Replace fields of an inherited feature addressed by dotted path.
    pub fn override_feature(mut self, path: &str, changes: FeatureOverride) -> Self {
        match self.root.find_mut(path) {
            Some(MemberDecl::Feature(f)) => changes.apply(f),
            _ => self
                .problems
                .push(format!("cannot override '{}': no such feature", path)),
        }
        self
    }

    /// Replace fields of an inherited action addressed by dotted path.
    pub fn override_action(mut self, path: &str, changes: ActionOverride) -> Self {
        match self.root.find_mut(path) {
            Some(MemberDecl::Action(a)) => changes.apply(a),
            _ => self
                .problems
                .push(format!("cannot override '{}': no such action", path)),
        }
        self
    }

    /// Compile and validate the declaration.
    pub fn build(self) -> InstrResult<Arc<DriverSchema>> {
        if self.name.trim().is_empty() {
            return Err(InstrError::Declaration("driver name is empty".into()));
        }
        if !self.problems.is_empty() {
            return Err(InstrError::Declaration(format!(
                "{}: {}",
                self.name,
                self.problems.join("; ")
            )));
        }
        let scope = Scope::default();
        let root = compile_node(&self.name, &self.root, &scope)?;
        info!(driver = %self.name, members = root.order.len(), "driver schema built");
        Ok(Arc::new(DriverSchema {
            name: self.name.clone(),
            ack: self.ack.clone(),
            root,
            declaration: self,
        }))
    }
}

// =============================================================================
// Compilation
// =============================================================================

#[derive(Debug, Clone, Default)]
struct Scope {
    /// Options features visible from this node (own and ancestors').
    options: Vec<String>,
    /// Enclosing channel families, nearest first.
    families: Vec<String>,
    /// Number of ancestors of the node.
    depth: usize,
}

fn compile_node(path: &str, decl: &NodeDecl, parent: &Scope) -> InstrResult<Arc<NodeSchema>> {
    let mut seen = HashSet::new();
    for member in &decl.members {
        if !seen.insert(member.name()) {
            return Err(InstrError::Declaration(format!(
                "{} declares '{}' twice",
                path,
                member.name()
            )));
        }
    }

    let mut scope = parent.clone();
    for member in &decl.members {
        if let MemberDecl::Feature(f) = member {
            if f.is_options() && !scope.options.contains(&f.name) {
                scope.options.push(f.name.clone());
            }
        }
    }

    let mut members = BTreeMap::new();
    let mut order = Vec::new();
    for member in &decl.members {
        let compiled = match member {
            MemberDecl::Feature(f) => Member::Feature(compile_feature(path, f, decl, &scope)?),
            MemberDecl::Action(a) => Member::Action(compile_action(path, a, &scope)?),
            MemberDecl::Subsystem(s) => {
                let gate = compile_gate(path, &s.name, s.gate.as_deref(), &scope)?;
                let child_scope = Scope {
                    depth: scope.depth + 1,
                    ..scope.clone()
                };
                let schema =
                    compile_node(&format!("{}.{}", path, s.name), &s.node, &child_scope)?;
                Member::Subsystem(SubsystemDescriptor {
                    name: s.name.clone(),
                    gate,
                    schema,
                })
            }
            MemberDecl::Channel(c) => Member::Channel(compile_channel(path, c, decl, &scope)?),
        };
        order.push(member.name().to_string());
        members.insert(member.name().to_string(), compiled);
    }

    Ok(Arc::new(NodeSchema {
        name: path.to_string(),
        members,
        order,
        limits: decl.limits.iter().cloned().collect(),
    }))
}

fn compile_gate(
    path: &str,
    member: &str,
    source: Option<&str>,
    scope: &Scope,
) -> InstrResult<Option<Gate>> {
    let Some(source) = source else {
        return Ok(None);
    };
    let gate = Gate::parse(source)?;
    for feature in gate.features() {
        if !scope.options.iter().any(|o| o == feature) {
            return Err(InstrError::Declaration(format!(
                "{}.{}: gate '{}' refers to '{}' which is not an options feature of this node or its parents",
                path, member, source, feature
            )));
        }
    }
    Ok(Some(gate))
}

fn compile_template(
    path: &str,
    member: &str,
    source: &str,
    value_placeholders: usize,
    scope: &Scope,
) -> InstrResult<CommandTemplate> {
    let template = CommandTemplate::parse(source)?;
    let problem = |message: String| {
        InstrError::Declaration(format!("{}.{}: '{}' {}", path, member, source, message))
    };
    if template.value_placeholders() != value_placeholders {
        return Err(problem(format!(
            "must contain {} value placeholder(s)",
            value_placeholders
        )));
    }
    if template.uses_channel_id() && scope.families.is_empty() {
        return Err(problem("uses {ch_id} outside of a channel".into()));
    }
    for family in template.families() {
        if !scope.families.iter().any(|f| f == family) {
            return Err(problem(format!(
                "refers to channel '{}' which does not enclose it",
                family
            )));
        }
    }
    Ok(template)
}

fn compile_feature(
    path: &str,
    f: &Feature,
    node: &NodeDecl,
    scope: &Scope,
) -> InstrResult<FeatureDescriptor> {
    let problem =
        |message: &str| InstrError::Declaration(format!("{}.{}: {}", path, f.name, message));

    if let Some((target, settable)) = &f.alias {
        return compile_alias(path, f, target, *settable, scope);
    }
    if f.getter.is_none() && f.setter.is_none() {
        return Err(problem("feature needs a getter or a setter"));
    }
    if f.is_options() {
        if f.getter.is_none() || f.setter.is_some() {
            return Err(problem("options features are read-only and need a getter"));
        }
        if f.gate.is_some() {
            return Err(problem("options features cannot be gated"));
        }
        if f.cache != CachePolicy::InstanceLifetime {
            return Err(problem("options features are cached for the instance lifetime"));
        }
    }
    let declared_limits = |name: &String| node.limits.iter().any(|(n, _)| n == name);
    if let Some(name) = &f.named_limits {
        if !declared_limits(name) {
            return Err(problem(&format!("limits '{}' are not declared on this node", name)));
        }
    }
    if let Some(name) = f.discard_limits.iter().find(|n| !declared_limits(*n)) {
        return Err(problem(&format!(
            "discarded limits '{}' are not declared on this node",
            name
        )));
    }
    let getter = f
        .getter
        .as_deref()
        .map(|s| compile_template(path, &f.name, s, 0, scope))
        .transpose()?;
    let setter = f
        .setter
        .as_deref()
        .map(|s| compile_template(path, &f.name, s, 1, scope))
        .transpose()?;
    let extract = f.extract.as_deref().map(Extract::new).transpose()?;
    let gate = compile_gate(path, &f.name, f.gate.as_deref(), scope)?;

    for dependent in &f.dependents {
        let declared = node
            .members
            .iter()
            .any(|m| matches!(m, MemberDecl::Feature(other) if &other.name == dependent));
        if !declared {
            return Err(problem(&format!(
                "dependent '{}' is not a feature of this node",
                dependent
            )));
        }
    }

    // A mapping with no explicit validator restricts writes to its keys.
    let validator = match (&f.validator, &f.mapping) {
        (Validator::Any, Some(mapping)) => {
            Validator::OneOf(mapping.user_values().cloned().collect())
        }
        (v, _) => v.clone(),
    };

    Ok(FeatureDescriptor {
        name: f.name.clone(),
        getter,
        setter,
        validator,
        extract,
        mapping: f.mapping.clone(),
        options_format: if f.is_options() {
            Some(f.options_format.unwrap_or_default())
        } else {
            None
        },
        cache: f.cache,
        dependents: f.dependents.clone(),
        gate,
        checks: f.checks.clone(),
        named_limits: f.named_limits.clone(),
        discard_limits: f.discard_limits.clone(),
        alias: None,
    })
}

fn compile_alias(
    path: &str,
    f: &Feature,
    target: &str,
    settable: bool,
    scope: &Scope,
) -> InstrResult<FeatureDescriptor> {
    let problem =
        |message: &str| InstrError::Declaration(format!("{}.{}: {}", path, f.name, message));

    let accessors = f.getter.is_some() || f.setter.is_some() || f.options_format.is_some();
    let engine_state = !f.dependents.is_empty()
        || f.named_limits.is_some()
        || !f.discard_limits.is_empty()
        || f.cache != CachePolicy::None;
    if accessors || engine_state {
        return Err(problem(
            "an alias only forwards to its target and takes no accessors, caching or limits",
        ));
    }
    let target_path = RelativePath::parse(target)
        .map_err(|err| problem(&format!("invalid alias target '{}': {}", target, err)))?;
    if target_path.levels() > scope.depth {
        return Err(problem(&format!(
            "alias target '{}' climbs above the driver",
            target
        )));
    }
    if target_path.levels() == 0 && target_path.path().to_string() == f.name {
        return Err(problem("alias targets itself"));
    }

    Ok(FeatureDescriptor {
        name: f.name.clone(),
        getter: None,
        setter: None,
        validator: Validator::Any,
        extract: None,
        mapping: None,
        options_format: None,
        cache: CachePolicy::None,
        dependents: Vec::new(),
        gate: compile_gate(path, &f.name, f.gate.as_deref(), scope)?,
        checks: f.checks.clone(),
        named_limits: None,
        discard_limits: Vec::new(),
        alias: Some(AliasTarget {
            path: target_path,
            settable,
        }),
    })
}

fn compile_action(path: &str, a: &Action, scope: &Scope) -> InstrResult<ActionDescriptor> {
    let mut names = HashSet::new();
    for (name, _) in &a.args {
        if !names.insert(name.as_str()) {
            return Err(InstrError::Declaration(format!(
                "{}.{}: argument '{}' declared twice",
                path, a.name, name
            )));
        }
    }
    Ok(ActionDescriptor {
        name: a.name.clone(),
        args: a.args.clone(),
        operation: a.operation.clone(),
        returns: a.returns.clone(),
        gate: compile_gate(path, &a.name, a.gate.as_deref(), scope)?,
        checks: a.checks.clone(),
    })
}

fn compile_channel(
    path: &str,
    c: &Channel,
    node: &NodeDecl,
    scope: &Scope,
) -> InstrResult<ChannelDescriptor> {
    let problem =
        |message: String| InstrError::Declaration(format!("{}.{}: {}", path, c.name, message));

    let ids = c
        .ids
        .clone()
        .ok_or_else(|| problem("channel needs a static id list or an id-listing action".into()))?;
    match &ids {
        IdSource::Static(list) if list.is_empty() => {
            return Err(problem("static id list is empty".into()))
        }
        IdSource::Static(list) => {
            for (alias, id) in &c.aliases {
                if !list.contains(id) {
                    return Err(problem(format!(
                        "alias '{}' targets unknown id '{}'",
                        alias, id
                    )));
                }
            }
        }
        IdSource::Listed(action) => {
            let listing = node.members.iter().find_map(|m| match m {
                MemberDecl::Action(a) if &a.name == action => Some(a),
                _ => None,
            });
            match listing {
                Some(a) if a.args.is_empty() => {}
                Some(_) => {
                    return Err(problem(format!(
                        "id-listing action '{}' must take no arguments",
                        action
                    )))
                }
                None => {
                    return Err(problem(format!(
                        "id-listing action '{}' is not declared on the parent",
                        action
                    )))
                }
            }
        }
    }

    let gate = compile_gate(path, &c.name, c.gate.as_deref(), scope)?;
    let mut child_scope = scope.clone();
    child_scope.families.insert(0, c.name.clone());
    child_scope.depth += 1;
    let schema = compile_node(&format!("{}.{}", path, c.name), &c.node, &child_scope)?;

    Ok(ChannelDescriptor {
        name: c.name.clone(),
        gate,
        schema,
        ids,
        aliases: c.aliases.iter().cloned().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::CommandOperation;
    use crate::convert::Mapping;
    use crate::named_limits::{DerivedLimits, Limits};

    fn freq() -> Feature {
        Feature::new("frequency")
            .getter("FREQ?")
            .setter("FREQ {:.2f}")
            .float(FloatLimits::range(1.0, 100_000.0).unwrap())
    }

    #[test]
    fn test_build_simple_schema() {
        let schema = DriverSchema::builder("FG")
            .feature(Feature::options("opt", "*OPT?"))
            .feature(freq().dependents(["waveform"]))
            .feature(
                Feature::new("waveform")
                    .getter("FUNC?")
                    .setter("FUNC {}")
                    .mapping(Mapping::symmetric([("sine", "SIN")])),
            )
            .build()
            .unwrap();
        let root = schema.root();
        assert_eq!(root.member_names(), &["opt", "frequency", "waveform"]);
        assert!(root.has_options_feature("opt"));
        assert_eq!(
            root.feature("waveform").unwrap().validator(),
            &Validator::OneOf(vec!["sine".into()])
        );
    }

    #[test]
    fn test_gate_syntax_fails_at_build() {
        let err = DriverSchema::builder("FG")
            .feature(Feature::options("opt", "*OPT?"))
            .feature(freq().gate("opt['k'] = 1"))
            .build()
            .unwrap_err();
        assert!(matches!(err, InstrError::GateSyntax { .. }));
    }

    #[test]
    fn test_gate_must_reference_options_feature() {
        let err = DriverSchema::builder("FG")
            .feature(freq().gate("opt['k'] == 1"))
            .build()
            .unwrap_err();
        assert!(matches!(err, InstrError::Declaration(_)));
    }

    #[test]
    fn test_dangling_dependent_is_rejected() {
        let err = DriverSchema::builder("FG")
            .feature(freq().dependents(["nope"]))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_setter_needs_value_placeholder() {
        let err = DriverSchema::builder("FG")
            .feature(Feature::new("x").setter("X"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("value placeholder"));
    }

    #[test]
    fn test_channel_validation() {
        let no_ids = DriverSchema::builder("FG")
            .channel(Channel::new("output", NodeDecl::new()))
            .build();
        assert!(no_ids.is_err());

        let bad_alias = DriverSchema::builder("FG")
            .channel(Channel::new("output", NodeDecl::new()).ids([1, 2]).alias("main", 3))
            .build();
        assert!(bad_alias.is_err());

        let missing_listing = DriverSchema::builder("FG")
            .channel(Channel::new("output", NodeDecl::new()).listed_by("list_outputs"))
            .build();
        assert!(missing_listing.is_err());

        let ch_id_outside = DriverSchema::builder("FG")
            .feature(Feature::new("x").getter("X{ch_id}?"))
            .build();
        assert!(ch_id_outside.is_err());
    }

    #[test]
    fn test_channel_templates_and_options_scope() {
        let schema = DriverSchema::builder("FG")
            .feature(Feature::options("opt", "*OPT?"))
            .action(
                Action::new("list_outputs", CommandOperation::query("OUTP:LIST?").unwrap())
                    .returns(Returns::list_of(Validator::Int(None))),
            )
            .channel(
                Channel::new(
                    "output",
                    NodeDecl::new().feature(
                        Feature::new("offset")
                            .getter("OUTP{output}:OFFS?")
                            .gate("opt['mod'] == 1"),
                    ),
                )
                .listed_by("list_outputs")
                .alias("main", 1),
            )
            .build()
            .unwrap();
        let output = schema.root().channel("output").unwrap();
        assert_eq!(
            output.canonical(&ChannelId::from("main")),
            ChannelId::Index(1)
        );
        assert_eq!(output.canonical(&ChannelId::from("2")), ChannelId::Index(2));
        assert!(schema.describe().contains("offset [feature, r]"));
    }

    #[test]
    fn test_derive_with_overrides() {
        let base = DriverSchema::builder("FG100")
            .feature(freq())
            .subsystem(Subsystem::new(
                "trigger",
                NodeDecl::new().feature(Feature::new("level").getter("TRIG:LEV?")),
            ))
            .build()
            .unwrap();
        let derived = base
            .derive("FG200")
            .override_feature(
                "frequency",
                FeatureOverride::new()
                    .validator(Validator::Float(Some(FloatLimits::range(1.0, 200_000.0).unwrap()))),
            )
            .override_feature("trigger.level", FeatureOverride::new().cache(CachePolicy::None))
            .feature(Feature::new("phase").getter("PHAS?"))
            .build()
            .unwrap();

        assert_eq!(derived.name(), "FG200");
        let f = derived.root().feature("frequency").unwrap();
        assert!(f.validate("f", &Value::Float(150_000.0)).is_ok());
        let level = derived
            .root()
            .subsystem("trigger")
            .unwrap()
            .schema()
            .feature("level")
            .unwrap();
        assert_eq!(level.cache(), CachePolicy::None);
        assert!(derived.root().feature("phase").is_some());

        // The base schema is untouched.
        let f = base.root().feature("frequency").unwrap();
        assert!(f.validate("f", &Value::Float(150_000.0)).is_err());
    }

    #[test]
    fn test_override_unknown_member_fails() {
        let base = DriverSchema::builder("FG").feature(freq()).build().unwrap();
        let err = base
            .derive("FG2")
            .override_feature("amplitude", FeatureOverride::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, InstrError::Declaration(_)));
    }

    #[test]
    fn test_options_cache_is_pinned() {
        let err = DriverSchema::builder("FG")
            .feature(Feature::options("opt", "*OPT?").cache(CachePolicy::None))
            .build()
            .unwrap_err();
        assert!(matches!(err, InstrError::Declaration(_)));
        assert!(err.to_string().contains("instance lifetime"));

        let base = DriverSchema::builder("FG")
            .feature(Feature::options("opt", "*OPT?"))
            .build()
            .unwrap();
        let err = base
            .derive("FG2")
            .override_feature("opt", FeatureOverride::new().cache(CachePolicy::UntilInvalidated))
            .build()
            .unwrap_err();
        assert!(matches!(err, InstrError::Declaration(_)));
    }

    #[test]
    fn test_named_limits_must_be_declared() {
        let amplitude = || {
            Feature::new("amplitude")
                .getter("VOLT?")
                .setter("VOLT {:.3f}")
                .limits("amplitude")
        };
        let err = DriverSchema::builder("FG")
            .feature(amplitude())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("limits 'amplitude'"));

        let err = DriverSchema::builder("FG")
            .feature(Feature::new("load").setter("LOAD {}").discard_limits(["span"]))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("'span'"));

        let range = Limits::Float(FloatLimits::range(0.0, 5.0).unwrap());
        let schema = DriverSchema::builder("FG")
            .limits("amplitude", DerivedLimits::fixed(range))
            .feature(amplitude())
            .feature(Feature::new("load").setter("LOAD {}").discard_limits(["amplitude"]))
            .build()
            .unwrap();
        let root = schema.root();
        assert!(root.limits("amplitude").is_some());
        assert_eq!(root.feature("amplitude").unwrap().named_limits(), Some("amplitude"));
        assert_eq!(root.feature("load").unwrap().discard_limits(), &["amplitude"]);

        let derived = schema
            .derive("FG2")
            .override_limits("amplitude", DerivedLimits::fixed(range))
            .override_limits("frequency.span", DerivedLimits::fixed(range))
            .build();
        assert!(derived.is_err());
    }

    #[test]
    fn test_alias_declarations() {
        let output = NodeDecl::new()
            .feature(Feature::new("offset").getter("OUTP{ch_id}:OFFS?"))
            .feature(Feature::alias("shift", "offset", false))
            .feature(Feature::alias("carrier", ".frequency", true));
        let schema = DriverSchema::builder("FG")
            .feature(freq())
            .channel(Channel::new("output", output).ids([1, 2]))
            .build()
            .unwrap();
        let node = schema.root().channel("output").unwrap().schema();
        let carrier = node.feature("carrier").unwrap().alias().unwrap();
        assert_eq!(carrier.path.levels(), 1);
        assert!(carrier.settable);
        assert_eq!(node.feature("shift").unwrap().cache(), CachePolicy::None);
        assert!(schema.describe().contains("carrier [alias, rw] -> .frequency"));

        let above_root = DriverSchema::builder("FG")
            .feature(Feature::alias("f", ".frequency", true))
            .feature(freq())
            .build();
        assert!(above_root.is_err());

        let with_getter = DriverSchema::builder("FG")
            .feature(freq())
            .feature(Feature::alias("f", "frequency", true).getter("F?"))
            .build();
        assert!(with_getter.is_err());

        let cached = DriverSchema::builder("FG")
            .feature(freq())
            .feature(Feature::alias("f", "frequency", true).cache(CachePolicy::UntilInvalidated))
            .build();
        assert!(cached.is_err());
    }

    #[test]
    fn test_feature_encode_decode() {
        let schema = DriverSchema::builder("FG")
            .feature(freq())
            .feature(
                Feature::new("status")
                    .getter("STAT?")
                    .register(["on", "", "error"]),
            )
            .feature(Feature::new("enabled").getter("OUTP?").setter("OUTP {}").boolean())
            .build()
            .unwrap();
        let root = schema.root();
        let f = root.feature("frequency").unwrap();
        assert_eq!(f.encode(&Value::Float(250.5)).unwrap(), "250.50");
        assert_eq!(f.decode("250.50\n").unwrap(), Value::Float(250.5));

        let enabled = root.feature("enabled").unwrap();
        assert_eq!(enabled.encode(&Value::Bool(true)).unwrap(), "1");
        assert_eq!(enabled.decode("OFF").unwrap(), Value::Bool(false));

        let status = root.feature("status").unwrap().decode("5").unwrap();
        assert_eq!(status.as_map().unwrap()["error"], Value::Bool(true));
    }
}
