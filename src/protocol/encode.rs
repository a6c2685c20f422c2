//! Frontend message encoding

use super::constants::{PROTOCOL_VERSION, SSL_REQUEST_CODE};
use super::message::{BoundValue, FrontendMessage};
use bytes::{BufMut, BytesMut};

/// Encode a frontend message onto the buffer.
///
/// Messages are appended; an extended-protocol batch
/// (Parse+Describe+Bind+Execute+Sync) encodes into one buffer and goes out in
/// a single write so Sync delimits the request group on the wire.
pub fn encode_message(msg: &FrontendMessage, buf: &mut BytesMut) {
    match msg {
        FrontendMessage::Startup { version, params } => encode_startup(buf, *version, params),
        FrontendMessage::Password(password) => {
            framed(buf, b'p', |buf| {
                put_cstr(buf, password);
            });
        }
        FrontendMessage::Query(query) => {
            framed(buf, b'Q', |buf| {
                put_cstr(buf, query);
            });
        }
        FrontendMessage::Parse { name, statement } => {
            framed(buf, b'P', |buf| {
                put_cstr(buf, name);
                put_cstr(buf, statement);
                // no prespecified parameter types; the server infers and
                // reports them via ParameterDescription
                buf.put_i16(0);
            });
        }
        FrontendMessage::Bind {
            portal,
            statement,
            params,
        } => {
            framed(buf, b'B', |buf| {
                put_cstr(buf, portal);
                put_cstr(buf, statement);
                put_format_codes(buf, params);
                buf.put_i16(params.len() as i16);
                for param in params {
                    match &param.bytes {
                        Some(bytes) => {
                            buf.put_i32(bytes.len() as i32);
                            buf.put_slice(bytes);
                        }
                        None => buf.put_i32(-1),
                    }
                }
                // all result columns in binary format
                buf.put_i16(1);
                buf.put_i16(1);
            });
        }
        FrontendMessage::Describe { statement } => {
            framed(buf, b'D', |buf| {
                buf.put_u8(b'S');
                put_cstr(buf, statement);
            });
        }
        FrontendMessage::Execute { portal } => {
            framed(buf, b'E', |buf| {
                put_cstr(buf, portal);
                buf.put_i32(0); // no row limit
            });
        }
        FrontendMessage::Sync => {
            buf.put_u8(b'S');
            buf.put_i32(4);
        }
        FrontendMessage::Terminate => {
            buf.put_u8(b'X');
            buf.put_i32(4);
        }
        FrontendMessage::SaslInitialResponse { mechanism, data } => {
            framed(buf, b'p', |buf| {
                put_cstr(buf, mechanism);
                buf.put_i32(data.len() as i32);
                buf.put_slice(data);
            });
        }
        FrontendMessage::SaslResponse { data } => {
            framed(buf, b'p', |buf| {
                buf.put_slice(data);
            });
        }
        FrontendMessage::SslRequest => {
            buf.put_i32(8);
            buf.put_i32(SSL_REQUEST_CODE);
        }
    }
}

/// Build the startup message for a session.
pub fn startup_message(
    user: &str,
    database: &str,
    time_zone: &str,
) -> FrontendMessage {
    FrontendMessage::Startup {
        version: PROTOCOL_VERSION,
        params: vec![
            ("user".to_string(), user.to_string()),
            ("database".to_string(), database.to_string()),
            ("client_encoding".to_string(), "UTF8".to_string()),
            ("TimeZone".to_string(), time_zone.to_string()),
        ],
    }
}

fn encode_startup(buf: &mut BytesMut, version: i32, params: &[(String, String)]) {
    // startup has no tag byte
    let len_pos = buf.len();
    buf.put_i32(0);
    buf.put_i32(version);
    for (key, value) in params {
        put_cstr(buf, key);
        put_cstr(buf, value);
    }
    buf.put_u8(0);
    patch_len(buf, len_pos);
}

/// Parameter format codes: one shared code when uniform, else one per value.
fn put_format_codes(buf: &mut BytesMut, params: &[BoundValue]) {
    let all_binary = params.iter().all(|p| p.format == 1);
    let all_text = params.iter().all(|p| p.format == 0);
    if params.is_empty() || all_binary {
        buf.put_i16(1);
        buf.put_i16(1);
    } else if all_text {
        buf.put_i16(1);
        buf.put_i16(0);
    } else {
        buf.put_i16(params.len() as i16);
        for param in params {
            buf.put_i16(param.format);
        }
    }
}

/// Write `tag`, reserve the length word, run `body`, then patch the length.
fn framed(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let len_pos = buf.len();
    buf.put_i32(0);
    body(buf);
    patch_len(buf, len_pos);
}

fn patch_len(buf: &mut BytesMut, len_pos: usize) {
    let len = (buf.len() - len_pos) as i32;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}
