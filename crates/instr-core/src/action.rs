//! Operations backing actions.
//!
//! An [`Action`](crate::schema::Action) validates its arguments and runs its
//! gate and checks; the work itself is delegated to an [`Operation`]
//! supplied by the driver author. [`CommandOperation`] covers the usual case
//! of a single command or query.

use crate::access::Access;
use crate::error::{InstrError, InstrResult};
use crate::template::CommandTemplate;
use crate::value::Value;
use async_trait::async_trait;
use std::fmt;

/// Work performed by an action once its arguments are validated.
#[async_trait]
pub trait Operation: Send + Sync + fmt::Debug {
    /// Run the operation on the node reached through `access`.
    ///
    /// The returned value goes through the action's return conversion.
    async fn call(&self, access: &mut Access<'_>, args: &[Value]) -> InstrResult<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    Query,
    Write,
}

/// Send one command, optionally carrying the arguments.
///
/// Arguments are formatted with the template's value spec and joined with
/// `,` into the single value placeholder.
#[derive(Debug, Clone)]
pub struct CommandOperation {
    template: CommandTemplate,
    kind: CommandKind,
}

impl CommandOperation {
    /// Side-effect-free query returning the raw response.
    pub fn query(template: &str) -> InstrResult<Self> {
        Ok(Self {
            template: CommandTemplate::parse(template)?,
            kind: CommandKind::Query,
        })
    }

    /// Write confirmed through the driver's acknowledgement policy. Returns
    /// the raw response.
    pub fn write(template: &str) -> InstrResult<Self> {
        Ok(Self {
            template: CommandTemplate::parse(template)?,
            kind: CommandKind::Write,
        })
    }

    /// Command sent when the operation runs.
    pub fn template(&self) -> &CommandTemplate {
        &self.template
    }
}

#[async_trait]
impl Operation for CommandOperation {
    async fn call(&self, access: &mut Access<'_>, args: &[Value]) -> InstrResult<Value> {
        let member = access.node().path().to_string();
        let command = self.template.resolve(&access.node().channel_context())?;
        let value = if args.is_empty() {
            None
        } else {
            let formatted: Result<Vec<String>, String> = args
                .iter()
                .map(|arg| self.template.format_value(arg))
                .collect();
            Some(
                formatted
                    .map_err(|message| InstrError::Validation {
                        member: member.clone(),
                        message,
                    })?
                    .join(","),
            )
        };
        let response = match self.kind {
            CommandKind::Query => {
                let command = crate::session::substitute(&command, value.as_deref());
                access.session().query(&command, &member).await?
            }
            CommandKind::Write => {
                access
                    .session()
                    .write(&command, value.as_deref(), &member)
                    .await?
            }
        };
        Ok(Value::Str(response.trim().to_string()))
    }
}
