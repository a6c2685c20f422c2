//! Backend message body decoding
//!
//! The framer strips the tag byte and the length word; every function here
//! sees only the message body. Unknown tags are not an error; they decode to
//! [`BackendMessage::Unknown`] so the connection can log and skip them.

use super::constants::{auth, tags};
use super::message::{
    AuthenticationRequest, BackendMessage, ErrorFields, FieldDescription, Notification,
    TransactionStatus,
};
use crate::{Error, Result};
use bytes::Bytes;

/// Decode one complete message body.
pub fn decode_body(tag: u8, body: &[u8]) -> Result<BackendMessage> {
    match tag {
        tags::AUTHENTICATION => decode_authentication(body),
        tags::BACKEND_KEY_DATA => decode_backend_key_data(body),
        tags::BIND_COMPLETE => Ok(BackendMessage::BindComplete),
        tags::COMMAND_COMPLETE => decode_command_complete(body),
        tags::DATA_ROW => decode_data_row(body),
        tags::EMPTY_QUERY_RESPONSE => Ok(BackendMessage::EmptyQueryResponse),
        tags::ERROR_RESPONSE => Ok(BackendMessage::ErrorResponse(decode_error_fields(body)?)),
        tags::NO_DATA => Ok(BackendMessage::NoData),
        tags::NOTICE_RESPONSE => Ok(BackendMessage::NoticeResponse(decode_error_fields(body)?)),
        tags::NOTIFICATION_RESPONSE => decode_notification(body),
        tags::PARAMETER_DESCRIPTION => decode_parameter_description(body),
        tags::PARAMETER_STATUS => decode_parameter_status(body),
        tags::PARSE_COMPLETE => Ok(BackendMessage::ParseComplete),
        tags::READY_FOR_QUERY => decode_ready_for_query(body),
        tags::ROW_DESCRIPTION => decode_row_description(body),
        _ => Ok(BackendMessage::Unknown {
            tag,
            body: Bytes::copy_from_slice(body),
        }),
    }
}

/// Cursor over a message body with bounds-checked primitive reads.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Protocol(format!("truncated {}", what)));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn i16(&mut self, what: &str) -> Result<i16> {
        let b = self.take(2, what)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self, what: &str) -> Result<i32> {
        let b = self.take(4, what)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        Ok(self.i32(what)? as u32)
    }

    /// NUL-terminated string; the terminator is consumed.
    fn cstr(&mut self, what: &str) -> Result<String> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Protocol(format!("missing NUL terminator in {}", what)))?;
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(s)
    }
}

fn decode_authentication(body: &[u8]) -> Result<BackendMessage> {
    let mut r = Reader::new(body);
    let kind = r.i32("authentication code")?;

    let request = match kind {
        auth::OK => AuthenticationRequest::Ok,
        auth::CLEARTEXT_PASSWORD => AuthenticationRequest::CleartextPassword,
        auth::MD5_PASSWORD => {
            let mut salt = [0u8; 4];
            salt.copy_from_slice(r.take(4, "md5 salt")?);
            AuthenticationRequest::Md5Password { salt }
        }
        auth::SASL => {
            let mut mechanisms = Vec::new();
            while r.remaining() > 0 {
                let mechanism = r.cstr("SASL mechanism")?;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            AuthenticationRequest::Sasl { mechanisms }
        }
        auth::SASL_CONTINUE => AuthenticationRequest::SaslContinue {
            data: body[r.pos..].to_vec(),
        },
        auth::SASL_FINAL => AuthenticationRequest::SaslFinal {
            data: body[r.pos..].to_vec(),
        },
        other => {
            return Err(Error::Protocol(format!(
                "unsupported authentication request: {}",
                other
            )))
        }
    };

    Ok(BackendMessage::Authentication(request))
}

fn decode_backend_key_data(body: &[u8]) -> Result<BackendMessage> {
    let mut r = Reader::new(body);
    Ok(BackendMessage::BackendKeyData {
        process_id: r.i32("backend process id")?,
        secret_key: r.i32("backend secret key")?,
    })
}

fn decode_command_complete(body: &[u8]) -> Result<BackendMessage> {
    let mut r = Reader::new(body);
    Ok(BackendMessage::CommandComplete(r.cstr("command tag")?))
}

fn decode_data_row(body: &[u8]) -> Result<BackendMessage> {
    let mut r = Reader::new(body);
    let count = r.i16("column count")? as usize;
    let mut columns = Vec::with_capacity(count);

    for _ in 0..count {
        let len = r.i32("column length")?;
        let column = if len == -1 {
            None
        } else {
            Some(Bytes::copy_from_slice(r.take(len as usize, "column data")?))
        };
        columns.push(column);
    }

    Ok(BackendMessage::DataRow(columns))
}

fn decode_error_fields(body: &[u8]) -> Result<ErrorFields> {
    let mut r = Reader::new(body);
    let mut fields = ErrorFields::default();

    loop {
        if r.remaining() == 0 {
            break;
        }
        let field_type = r.u8("error field type")?;
        if field_type == 0 {
            break;
        }
        let value = r.cstr("error field value")?;

        match field_type {
            b'S' => fields.severity = Some(value),
            b'C' => fields.code = Some(value),
            b'M' => fields.message = Some(value),
            b'D' => fields.detail = Some(value),
            b'H' => fields.hint = Some(value),
            b'P' => fields.position = Some(value),
            _ => {} // ignore the rest of the field taxonomy
        }
    }

    Ok(fields)
}

fn decode_notification(body: &[u8]) -> Result<BackendMessage> {
    let mut r = Reader::new(body);
    Ok(BackendMessage::NotificationResponse(Notification {
        process_id: r.i32("notification process id")?,
        channel: r.cstr("notification channel")?,
        payload: r.cstr("notification payload")?,
    }))
}

fn decode_parameter_description(body: &[u8]) -> Result<BackendMessage> {
    let mut r = Reader::new(body);
    let count = r.i16("parameter count")? as usize;
    let mut oids = Vec::with_capacity(count);
    for _ in 0..count {
        oids.push(r.u32("parameter type oid")?);
    }
    Ok(BackendMessage::ParameterDescription(oids))
}

fn decode_parameter_status(body: &[u8]) -> Result<BackendMessage> {
    let mut r = Reader::new(body);
    Ok(BackendMessage::ParameterStatus {
        name: r.cstr("parameter name")?,
        value: r.cstr("parameter value")?,
    })
}

fn decode_ready_for_query(body: &[u8]) -> Result<BackendMessage> {
    let mut r = Reader::new(body);
    let status = r.u8("transaction status")?;
    Ok(BackendMessage::ReadyForQuery(TransactionStatus::from_byte(
        status,
    )))
}

fn decode_row_description(body: &[u8]) -> Result<BackendMessage> {
    let mut r = Reader::new(body);
    let count = r.i16("field count")? as usize;
    let mut fields = Vec::with_capacity(count);

    for _ in 0..count {
        let name = r.cstr("field name")?;
        fields.push(FieldDescription {
            name,
            table_oid: r.u32("table oid")?,
            column_attr: r.i16("column attribute")?,
            type_oid: r.u32("type oid")?,
            type_size: r.i16("type size")?,
            type_modifier: r.i32("type modifier")?,
            format_code: r.i16("format code")?,
        });
    }

    Ok(BackendMessage::RowDescription(fields))
}
