//! Compiled endpoint descriptors.
//!
//! `compile` turns a validated declaration into an immutable dispatch plan:
//! one [`CompiledCallback`] per selected slot, each carrying a binding plan
//! of small tagged slots.  At dispatch time the plan is walked once to fill
//! the positional [`Args`] buffer — no lookups, no reflection, the hot path
//! is branch-predictable.

use std::any::Any;
use std::sync::Arc;

use ws_proto::CloseReason;

use crate::codec::CodecSuite;
use crate::endpoint::{
    Arg, Args, CallbackFn, Endpoint, EndpointConfig, MessageShape, Param, PathTarget,
    StateFactory,
};
use crate::error::{ConfigError, DispatchError};
use crate::session::Session;
use crate::uri_template::UriTemplate;
use crate::validator::{self, SelectedCallback};

/// One compiled argument slot.
pub(crate) enum Slot {
    Session,
    Config,
    CloseReason,
    Cause,
    PathParam {
        name: Arc<str>,
        target: PathTarget,
        /// Whether the template actually declares this variable; resolved
        /// at compile time so a missing name binds null with no lookup.
        present: bool,
    },
    Message,
    LastFlag,
}

/// Payload value for the message slot of one invocation.
pub(crate) enum MessageValue {
    Text(String),
    Binary(Vec<u8>),
    Pong(Vec<u8>),
    Object(Box<dyn Any + Send>),
}

/// Everything a binding plan may draw from when filling arguments.
pub(crate) struct BindValues<'a> {
    pub(crate) session: &'a Arc<Session>,
    pub(crate) config: &'a Arc<EndpointConfig>,
    pub(crate) close_reason: Option<&'a CloseReason>,
    pub(crate) cause: Option<&'a Arc<DispatchError>>,
    pub(crate) message: Option<MessageValue>,
    pub(crate) last: bool,
}

/// A selected callback with its compiled binding plan.
pub(crate) struct CompiledCallback {
    plan: Box<[Slot]>,
    pub(crate) invoke: CallbackFn,
    pub(crate) shape: Option<MessageShape>,
    pub(crate) partial: bool,
}

impl CompiledCallback {
    fn compile(selected: SelectedCallback, template: &UriTemplate) -> Self {
        let plan = selected
            .params
            .iter()
            .map(|param| match param {
                Param::Session => Slot::Session,
                Param::Config => Slot::Config,
                Param::CloseReason => Slot::CloseReason,
                Param::Cause => Slot::Cause,
                Param::PathParam { name, target } => Slot::PathParam {
                    name: Arc::from(name.as_str()),
                    target: *target,
                    present: template.has_variable(name),
                },
                Param::Message(_) => Slot::Message,
                Param::LastFlag => Slot::LastFlag,
            })
            .collect();
        CompiledCallback {
            plan,
            invoke: selected.invoke,
            shape: selected.shape,
            partial: selected.partial,
        }
    }

    /// Fill the argument buffer in one pass over the plan.
    ///
    /// Fails only on a path-parameter parse error, which the dispatcher
    /// routes as a decode failure.
    pub(crate) fn bind(&self, mut values: BindValues<'_>) -> Result<Args, DispatchError> {
        let mut args = Vec::with_capacity(self.plan.len());
        for slot in &self.plan {
            let arg = match slot {
                Slot::Session => Arg::Session(Arc::clone(values.session)),
                Slot::Config => Arg::Config(Arc::clone(values.config)),
                Slot::CloseReason => Arg::CloseReason(
                    values.close_reason.cloned().unwrap_or_else(CloseReason::normal),
                ),
                Slot::Cause => Arg::Cause(values.cause.cloned().unwrap_or_else(|| {
                    Arc::new(DispatchError::Transport("unknown cause".to_owned()))
                })),
                Slot::PathParam {
                    name,
                    target,
                    present,
                } => {
                    let value = if *present {
                        match values.session.path_params().get(name) {
                            Some(raw) => {
                                Some(target.parse(raw).map_err(DispatchError::Decode)?)
                            }
                            None => None,
                        }
                    } else {
                        None
                    };
                    Arg::PathParam {
                        name: Arc::clone(name),
                        value,
                    }
                }
                Slot::Message => match values.message.take() {
                    Some(MessageValue::Text(text)) => Arg::Text(text),
                    Some(MessageValue::Binary(data)) => Arg::Binary(data),
                    Some(MessageValue::Pong(data)) => Arg::Pong(data),
                    Some(MessageValue::Object(value)) => Arg::Object(value),
                    None => {
                        return Err(DispatchError::Protocol(
                            "message slot bound without a payload".to_owned(),
                        ));
                    }
                },
                Slot::LastFlag => Arg::Last(values.last),
            };
            args.push(arg);
        }
        Ok(Args::new(args))
    }
}

/// The immutable dispatch plan of one registered endpoint.
pub(crate) struct EndpointDescriptor {
    pub(crate) template: UriTemplate,
    pub(crate) config: Arc<EndpointConfig>,
    pub(crate) factory: StateFactory,
    pub(crate) open: Option<CompiledCallback>,
    pub(crate) close: Option<CompiledCallback>,
    pub(crate) error: Option<CompiledCallback>,
    pub(crate) text: Option<CompiledCallback>,
    pub(crate) binary: Option<CompiledCallback>,
    pub(crate) pong: Option<CompiledCallback>,
    pub(crate) codecs: CodecSuite,
}

/// Validate a declaration and compile it against its URI template.
pub(crate) fn compile(
    endpoint: Endpoint,
    template: UriTemplate,
) -> Result<EndpointDescriptor, ConfigError> {
    let selection = validator::validate(&endpoint)?;
    let config = Arc::new(EndpointConfig::new(
        template.path().to_owned(),
        endpoint.subprotocols,
    ));

    let compile_slot =
        |slot: Option<SelectedCallback>| slot.map(|s| CompiledCallback::compile(s, &template));

    Ok(EndpointDescriptor {
        open: compile_slot(selection.open),
        close: compile_slot(selection.close),
        error: compile_slot(selection.error),
        text: compile_slot(selection.text),
        binary: compile_slot(selection.binary),
        pong: compile_slot(selection.pong),
        config,
        factory: endpoint.factory,
        codecs: CodecSuite::new(endpoint.decoders, endpoint.encoders),
        template,
    })
}
