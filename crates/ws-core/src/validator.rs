//! Registration-time validation of endpoint declarations.
//!
//! Runs once per `register()`.  A rejected declaration produces a
//! [`ConfigError`] and leaves no trace: the registry is only touched after
//! every check has passed.

use std::fmt;

use crate::codec::Decoder;
use crate::endpoint::{
    CallbackFn, DeclaredCallback, DeclaredRole, Endpoint, MessageShape, Param,
};
use crate::error::{ConfigError, MAX_CALLBACK_PARAMS};

/// The six callback slots an endpoint may fill, at most once each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Open,
    Close,
    Error,
    TextMessage,
    BinaryMessage,
    Pong,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            CallbackKind::Open => "open",
            CallbackKind::Close => "close",
            CallbackKind::Error => "error",
            CallbackKind::TextMessage => "text-message",
            CallbackKind::BinaryMessage => "binary-message",
            CallbackKind::Pong => "pong",
        };
        f.write_str(word)
    }
}

/// A callback that passed validation, with its classified slot.
pub(crate) struct SelectedCallback {
    pub(crate) params: Vec<Param>,
    pub(crate) invoke: CallbackFn,
    pub(crate) shape: Option<MessageShape>,
    pub(crate) partial: bool,
}

/// The validated callback set of one endpoint.
pub(crate) struct Selection {
    pub(crate) open: Option<SelectedCallback>,
    pub(crate) close: Option<SelectedCallback>,
    pub(crate) error: Option<SelectedCallback>,
    pub(crate) text: Option<SelectedCallback>,
    pub(crate) binary: Option<SelectedCallback>,
    pub(crate) pong: Option<SelectedCallback>,
}

/// Validate every declared callback and classify it into its slot.
pub(crate) fn validate(endpoint: &Endpoint) -> Result<Selection, ConfigError> {
    let mut selection = Selection {
        open: None,
        close: None,
        error: None,
        text: None,
        binary: None,
        pong: None,
    };

    for declared in &endpoint.declared {
        let kind = classify(declared, &endpoint.decoders)?;
        check_params(kind, declared)?;

        let (shape, partial) = message_traits(declared);
        let selected = SelectedCallback {
            params: declared.params.clone(),
            invoke: declared.invoke.clone(),
            shape,
            partial,
        };

        let slot = match kind {
            CallbackKind::Open => &mut selection.open,
            CallbackKind::Close => &mut selection.close,
            CallbackKind::Error => &mut selection.error,
            CallbackKind::TextMessage => &mut selection.text,
            CallbackKind::BinaryMessage => &mut selection.binary,
            CallbackKind::Pong => &mut selection.pong,
        };
        if slot.is_some() {
            return Err(ConfigError::DuplicateCallback(kind));
        }
        *slot = Some(selected);
    }

    Ok(selection)
}

/// Derive the slot a declared callback fills.  Message callbacks classify
/// by the shape of their single message parameter.
fn classify(
    declared: &DeclaredCallback,
    decoders: &[Decoder],
) -> Result<CallbackKind, ConfigError> {
    match declared.role {
        DeclaredRole::Open => Ok(CallbackKind::Open),
        DeclaredRole::Close => Ok(CallbackKind::Close),
        DeclaredRole::Error => Ok(CallbackKind::Error),
        DeclaredRole::Message => {
            let mut shapes = declared.params.iter().filter_map(|p| match p {
                Param::Message(shape) => Some(*shape),
                _ => None,
            });
            let shape = shapes.next().ok_or(ConfigError::MissingMessageParameter)?;
            if shapes.next().is_some() {
                return Err(ConfigError::ExtraMessageParameter);
            }
            match shape {
                MessageShape::Text | MessageShape::Reader | MessageShape::Primitive(_) => {
                    Ok(CallbackKind::TextMessage)
                }
                MessageShape::Binary
                | MessageShape::BinaryArray
                | MessageShape::InputStream => Ok(CallbackKind::BinaryMessage),
                MessageShape::Pong => Ok(CallbackKind::Pong),
                MessageShape::Custom { type_id, type_name } => {
                    let text = decoders
                        .iter()
                        .any(|d| d.is_text_side() && d.target() == type_id);
                    let binary = decoders
                        .iter()
                        .any(|d| !d.is_text_side() && d.target() == type_id);
                    match (text, binary) {
                        (true, true) => Err(ConfigError::AmbiguousMessageType(type_name)),
                        (true, false) => Ok(CallbackKind::TextMessage),
                        (false, true) => Ok(CallbackKind::BinaryMessage),
                        (false, false) => Err(ConfigError::UndecodableMessageType(type_name)),
                    }
                }
            }
        }
    }
}

/// Enforce the per-slot parameter rules.
fn check_params(kind: CallbackKind, declared: &DeclaredCallback) -> Result<(), ConfigError> {
    let params = &declared.params;
    if params.len() > MAX_CALLBACK_PARAMS {
        return Err(ConfigError::TooManyParameters(params.len()));
    }

    let is_message = matches!(
        kind,
        CallbackKind::TextMessage | CallbackKind::BinaryMessage | CallbackKind::Pong
    );

    for (index, param) in params.iter().enumerate() {
        let allowed = match param {
            Param::Session | Param::PathParam { .. } => true,
            Param::Config => kind == CallbackKind::Open,
            Param::CloseReason => kind == CallbackKind::Close,
            Param::Cause => kind == CallbackKind::Error,
            Param::Message(_) => is_message,
            Param::LastFlag => {
                if !is_message {
                    false
                } else if index != params.len() - 1 {
                    return Err(ConfigError::MisplacedLastFlag);
                } else {
                    true
                }
            }
        };
        if !allowed {
            return Err(ConfigError::ParameterNotAllowed {
                kind,
                param: param.word(),
            });
        }
    }

    if kind == CallbackKind::Error && !params.iter().any(|p| matches!(p, Param::Cause)) {
        return Err(ConfigError::MissingCause);
    }

    if params.iter().any(|p| matches!(p, Param::LastFlag)) {
        let shape = params.iter().find_map(|p| match p {
            Param::Message(shape) => Some(*shape),
            _ => None,
        });
        if let Some(shape) = shape {
            if matches!(
                shape,
                MessageShape::Reader | MessageShape::InputStream | MessageShape::Pong
            ) {
                return Err(ConfigError::LastFlagUnsupported(shape.payload_word()));
            }
        }
    }

    Ok(())
}

fn message_traits(declared: &DeclaredCallback) -> (Option<MessageShape>, bool) {
    let shape = declared.params.iter().find_map(|p| match p {
        Param::Message(shape) => Some(*shape),
        _ => None,
    });
    let partial = declared.params.iter().any(|p| matches!(p, Param::LastFlag));
    (shape, partial)
}
