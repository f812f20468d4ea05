//! Preconditions evaluated before every access to a member.
//!
//! Checks run after the options gate and before any I/O. Unlike gates they
//! are not memoized: a check reading another feature sees that feature's
//! current (possibly cached) value on every call.

use crate::access::Access;
use crate::error::InstrResult;
use crate::gate::CompareOp;
use crate::value::Value;
use async_trait::async_trait;
use std::fmt;

/// What the checked member is being asked to do.
#[derive(Debug, Clone, Copy)]
pub enum CheckInput<'a> {
    /// Feature read.
    Get,
    /// Feature write with the validated candidate value.
    Set(&'a Value),
    /// Action call with the validated arguments.
    Invoke(&'a [Value]),
}

impl CheckInput<'_> {
    /// Value under consideration: the candidate of a write or the first
    /// argument of a call.
    pub fn candidate(&self) -> Option<&Value> {
        match self {
            CheckInput::Get => None,
            CheckInput::Set(value) => Some(value),
            CheckInput::Invoke(args) => args.first(),
        }
    }
}

/// A precondition attached to a feature or action.
#[async_trait]
pub trait Check: Send + Sync + fmt::Debug {
    /// Short description used in [`InstrError::PreconditionFailed`](crate::InstrError::PreconditionFailed).
    fn describe(&self) -> String;

    /// Evaluate the check on the node reached through `access`.
    async fn holds(&self, access: &mut Access<'_>, input: CheckInput<'_>) -> InstrResult<bool>;
}

/// When a [`FeatureCheck`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckScope {
    /// Before reads, writes and calls.
    Always,
    /// Before reads only.
    GetOnly,
    /// Before writes and calls only.
    SetOnly,
}

/// Right hand side of a [`FeatureCheck`].
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// A fixed value.
    Literal(Value),
    /// The value being written (or the first call argument).
    Candidate,
}

/// Compare another feature of the same node with a literal or with the
/// candidate value, e.g. "trigger source must be BUS before firing".
#[derive(Debug, Clone)]
pub struct FeatureCheck {
    feature: String,
    op: CompareOp,
    operand: Operand,
    scope: CheckScope,
}

impl FeatureCheck {
    /// Check `feature op operand`, applied before every access.
    pub fn new(feature: impl Into<String>, op: CompareOp, operand: Operand) -> Self {
        Self {
            feature: feature.into(),
            op,
            operand,
            scope: CheckScope::Always,
        }
    }

    /// `feature == literal`.
    pub fn equals(feature: impl Into<String>, literal: impl Into<Value>) -> Self {
        Self::new(feature, CompareOp::Eq, Operand::Literal(literal.into()))
    }

    /// Restrict the check to reads or to writes.
    pub fn with_scope(mut self, scope: CheckScope) -> Self {
        self.scope = scope;
        self
    }
}

#[async_trait]
impl Check for FeatureCheck {
    fn describe(&self) -> String {
        match &self.operand {
            Operand::Literal(v) => format!("{} {} {}", self.feature, self.op, v),
            Operand::Candidate => format!("{} {} value", self.feature, self.op),
        }
    }

    async fn holds(&self, access: &mut Access<'_>, input: CheckInput<'_>) -> InstrResult<bool> {
        let applies = match (self.scope, input) {
            (CheckScope::Always, _) => true,
            (CheckScope::GetOnly, CheckInput::Get) => true,
            (CheckScope::SetOnly, CheckInput::Set(_) | CheckInput::Invoke(_)) => true,
            _ => false,
        };
        if !applies {
            return Ok(true);
        }
        let right = match &self.operand {
            Operand::Literal(v) => v.clone(),
            Operand::Candidate => match input.candidate() {
                Some(v) => v.clone(),
                None => return Ok(true),
            },
        };
        let left = access.get(&self.feature).await?;
        Ok(self.op.apply(&left, &right))
    }
}
