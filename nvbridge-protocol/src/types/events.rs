//! Parsers for structured editor event payloads

use rmpv::Value;

use super::handle::decode_handle;

/// Event payload parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventParseError {
    #[error("{event}: expected {expected} params, found {found}")]
    WrongArity {
        event: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{event}: invalid field '{field}': {reason}")]
    InvalidField {
        event: &'static str,
        field: &'static str,
        reason: String,
    },
}

/// Lines of a buffer were replaced
///
/// Params: `[buf, changedtick, firstline, lastline, linedata, more]`.
/// `changedtick` is nil when the change did not bump the revision counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufLinesEvent {
    pub buffer: i64,
    pub changedtick: Option<u64>,
    pub first_line: i64,
    pub last_line: i64,
    pub lines: Vec<String>,
    /// More events follow for the same change
    pub more: bool,
}

impl BufLinesEvent {
    pub const NAME: &'static str = "nvim_buf_lines_event";

    pub fn parse(params: &[Value]) -> Result<Self, EventParseError> {
        const EVENT: &str = BufLinesEvent::NAME;

        if params.len() != 6 {
            return Err(EventParseError::WrongArity {
                event: EVENT,
                expected: 6,
                found: params.len(),
            });
        }

        let field_err = |field: &'static str, reason: String| EventParseError::InvalidField {
            event: EVENT,
            field,
            reason,
        };

        let buffer = decode_handle(&params[0]).map_err(|e| field_err("buf", e.to_string()))?;

        let changedtick = if params[1].is_nil() {
            None
        } else {
            Some(
                params[1]
                    .as_u64()
                    .ok_or_else(|| field_err("changedtick", format!("not an unsigned integer: {}", params[1])))?,
            )
        };

        let first_line = params[2]
            .as_i64()
            .ok_or_else(|| field_err("firstline", format!("not an integer: {}", params[2])))?;
        let last_line = params[3]
            .as_i64()
            .ok_or_else(|| field_err("lastline", format!("not an integer: {}", params[3])))?;

        let lines = params[4]
            .as_array()
            .ok_or_else(|| field_err("linedata", "not an array".into()))?
            .iter()
            .map(|line| {
                line.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| field_err("linedata", format!("line is not a string: {}", line)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let more = params[5]
            .as_bool()
            .ok_or_else(|| field_err("more", format!("not a boolean: {}", params[5])))?;

        Ok(Self {
            buffer,
            changedtick,
            first_line,
            last_line,
            lines,
            more,
        })
    }
}

/// Updates for a buffer stopped
///
/// Params: `[buf]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufDetachEvent {
    pub buffer: i64,
}

impl BufDetachEvent {
    pub const NAME: &'static str = "nvim_buf_detach_event";

    pub fn parse(params: &[Value]) -> Result<Self, EventParseError> {
        match params {
            [buf] => {
                let buffer = decode_handle(buf).map_err(|e| EventParseError::InvalidField {
                    event: Self::NAME,
                    field: "buf",
                    reason: e.to_string(),
                })?;
                Ok(Self { buffer })
            }
            _ => Err(EventParseError::WrongArity {
                event: Self::NAME,
                expected: 1,
                found: params.len(),
            }),
        }
    }
}
