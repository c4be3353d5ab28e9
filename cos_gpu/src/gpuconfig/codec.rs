//! Text encodings for the build-request payload.
//!
//! The payload is stored next to the record metadata as a human readable file. The default
//! [`TextProto`] codec writes the protobuf text format so the objects stay readable by the existing
//! proto tooling around the config bucket.

use super::BuildRequest;
use std::fmt::Debug;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("line {line}: could not parse '{content}'; {reason}")]
    Syntax {
        line: usize,
        content: String,
        reason: String,
    },

    #[error("line {line}: unknown field '{field}'")]
    UnknownField { line: usize, field: String },

    #[error("line {line}: field '{field}' set more than once")]
    DuplicateField { line: usize, field: String },
}

pub trait PayloadCodec: Debug + Send + Sync {
    /// Name of the payload object under a record prefix.
    fn file_name(&self) -> &'static str;
    fn encode(&self, request: &BuildRequest) -> String;
    fn decode(&self, raw: &str) -> Result<BuildRequest, CodecError>;
}

impl BuildRequest {
    const FIELD_NAMES: [&'static str; 6] = [
        "kernel_src_tarball_gcs",
        "kernel_headers_tarball_gcs",
        "nvidia_runfile_address",
        "toolchain_tarball_gcs",
        "toolchain_env_gcs",
        "driver_output_gcs_dir",
    ];

    /// Fields in declaration order, paired with their wire names.
    fn fields(&self) -> [(&'static str, &String); 6] {
        [
            (Self::FIELD_NAMES[0], &self.kernel_src_tarball_gcs),
            (Self::FIELD_NAMES[1], &self.kernel_headers_tarball_gcs),
            (Self::FIELD_NAMES[2], &self.nvidia_runfile_address),
            (Self::FIELD_NAMES[3], &self.toolchain_tarball_gcs),
            (Self::FIELD_NAMES[4], &self.toolchain_env_gcs),
            (Self::FIELD_NAMES[5], &self.driver_output_gcs_dir),
        ]
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut String> {
        match name {
            "kernel_src_tarball_gcs" => Some(&mut self.kernel_src_tarball_gcs),
            "kernel_headers_tarball_gcs" => Some(&mut self.kernel_headers_tarball_gcs),
            "nvidia_runfile_address" => Some(&mut self.nvidia_runfile_address),
            "toolchain_tarball_gcs" => Some(&mut self.toolchain_tarball_gcs),
            "toolchain_env_gcs" => Some(&mut self.toolchain_env_gcs),
            "driver_output_gcs_dir" => Some(&mut self.driver_output_gcs_dir),
            _ => None,
        }
    }
}

/// Protobuf text format limited to the flat string fields of [`BuildRequest`]. Unset (empty)
/// fields are omitted, matching proto2 optional semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextProto;

impl PayloadCodec for TextProto {
    fn file_name(&self) -> &'static str {
        "config.textproto"
    }

    fn encode(&self, request: &BuildRequest) -> String {
        let mut out = String::new();

        for (name, value) in request.fields() {
            if value.is_empty() {
                continue;
            }
            out.push_str(name);
            out.push_str(": \"");
            out.push_str(&escape(value));
            out.push_str("\"\n");
        }

        out
    }

    fn decode(&self, raw: &str) -> Result<BuildRequest, CodecError> {
        let mut request = BuildRequest::default();
        let mut seen: Vec<&str> = vec![];

        for (index, line) in raw.lines().enumerate() {
            let line_num = index + 1;
            let content = line.trim();

            if content.is_empty() || content.starts_with('#') {
                continue;
            }

            let syntax_err = |reason: &str| CodecError::Syntax {
                line: line_num,
                content: content.to_string(),
                reason: reason.to_string(),
            };

            let (name, value) = content
                .split_once(':')
                .ok_or_else(|| syntax_err("expected 'field: \"value\"'"))?;
            let name = name.trim();

            let value = unquote(value.trim()).map_err(|reason| syntax_err(&reason))?;

            let Some(field) = request.field_mut(name) else {
                return Err(CodecError::UnknownField {
                    line: line_num,
                    field: name.to_string(),
                });
            };

            if seen.contains(&name) {
                return Err(CodecError::DuplicateField {
                    line: line_num,
                    field: name.to_string(),
                });
            }

            *field = value;
            seen.push(name);
        }

        Ok(request)
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\'' => escaped.push_str("\\'"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            _ => escaped.push(c),
        }
    }

    escaped
}

/// Strips the surrounding quotes (single or double) and resolves escape sequences.
///
/// Octal escapes (`\303\251`) are raw bytes, which is how older protobuf text writers emit
/// anything outside ASCII; the unescaped bytes must form valid UTF-8.
fn unquote(value: &str) -> Result<String, String> {
    let mut chars = value.chars().peekable();

    let quote = match chars.next() {
        Some(q @ ('"' | '\'')) => q,
        _ => return Err("value must be a quoted string".into()),
    };

    let mut out: Vec<u8> = Vec::with_capacity(value.len());
    let mut closed = false;
    let mut utf8 = [0u8; 4];

    while let Some(c) = chars.next() {
        if closed {
            return Err("unexpected content after closing quote".into());
        }

        match c {
            '\\' => match chars.next() {
                Some('n') => out.push(b'\n'),
                Some('r') => out.push(b'\r'),
                Some('t') => out.push(b'\t'),
                Some(e @ ('\\' | '"' | '\'')) => out.push(e as u8),
                Some(first @ '0'..='7') => {
                    let mut code = first as u32 - '0' as u32;
                    for _ in 0..2 {
                        match chars.peek() {
                            Some(&d @ '0'..='7') => {
                                code = code * 8 + (d as u32 - '0' as u32);
                                chars.next();
                            }
                            _ => break,
                        }
                    }

                    let byte = u8::try_from(code)
                        .map_err(|_| format!("octal escape '\\{code:o}' is out of range"))?;
                    out.push(byte);
                }
                Some(other) => return Err(format!("unsupported escape sequence '\\{other}'")),
                None => return Err("dangling escape at end of value".into()),
            },
            c if c == quote => closed = true,
            c => out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes()),
        }
    }

    if !closed {
        return Err("missing closing quote".into());
    }

    String::from_utf8(out).map_err(|e| format!("escaped value is not valid utf-8; {e}"))
}
