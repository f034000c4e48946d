//! TLS handshake parsing for payload inspection.
//!
//! Accepts a single TLS record carrying a ClientHello or ServerHello and
//! extracts the fields JA3 fingerprinting needs: protocol version, cipher
//! suites, extension types, elliptic curves, EC point formats, plus the SNI
//! and first ALPN names. GREASE values are excluded from every list.
//!
//! Anything that is not a parsable client or server hello yields `None`;
//! the caller treats that as "no TLS in this flow", not as an error.

use crate::stream::ByteReader;

use log::debug;
use serde::Serialize;

/// TLS record type of a handshake message.
const RECORD_TYPE_HANDSHAKE: u8 = 0x16;

const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_SERVER_HELLO: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HandshakeSide {
    Client,
    Server,
}

/// Parsed hello message of a TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TlsHandshake {
    /// Version from the record layer.
    pub tls_version: u16,
    /// Version from the hello message; the value JA3 uses.
    pub protocol_version: u16,
    /// Two-character version label ("13", "12", ..., "s2").
    pub char_version: [u8; 2],
    pub side: HandshakeSide,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<u16>,
    pub elliptic_curves: Vec<u16>,
    pub ec_point_formats: Vec<u16>,
    pub signatures: Vec<u16>,
    pub sni_name: String,
    pub alpn_name: String,
}

impl TlsHandshake {
    fn new(tls_version: u16, side: HandshakeSide) -> Self {
        TlsHandshake {
            tls_version,
            protocol_version: 0,
            char_version: [b'0', b'0'],
            side,
            cipher_suites: Vec::new(),
            extensions: Vec::new(),
            elliptic_curves: Vec::new(),
            ec_point_formats: Vec::new(),
            signatures: Vec::new(),
            sni_name: String::new(),
            alpn_name: String::new(),
        }
    }
}

/// GREASE values follow the pattern 0xXaXa with identical bytes.
///
/// `grease_table = {0x0a0a, 0x1a1a, ..., 0xfafa}`
pub fn is_grease(val: u16) -> bool {
    if val & 0x0f0f != 0x0a0a {
        return false;
    }
    let bytes = val.to_be_bytes();
    bytes[0] == bytes[1]
}

/// Parses a TLS record containing a ClientHello or ServerHello.
pub fn parse(data: &[u8]) -> Option<TlsHandshake> {
    // TLS record header: type(1) version(2) length(2), then the handshake
    // message header: type(1) length(3)
    if data.len() < 9 || data[0] != RECORD_TYPE_HANDSHAKE {
        return None;
    }

    let mut r = ByteReader::new(data);
    r.skip(1);

    let tls_version = r.get_u16();
    match tls_version {
        0x0002 | 0x0300 | 0x0301 | 0x0302 | 0x0303 | 0x0304 => {}
        _ => {
            debug!("tls: record version 0x{:x} out of range", tls_version);
            return None;
        }
    }

    let content_length = r.get_u16() as usize;
    if content_length > r.available() {
        debug!("tls: short record, need {}, have {}", content_length, r.available());
        return None;
    }

    let message_type = r.get_u8();
    let message_length = r.get_u24() as usize;
    if message_length > r.available() {
        return None;
    }

    match message_type {
        HANDSHAKE_CLIENT_HELLO => {
            let mut hello = TlsHandshake::new(tls_version, HandshakeSide::Client);
            parse_client_hello(&mut hello, &mut r).then_some(hello)
        }
        HANDSHAKE_SERVER_HELLO => {
            let mut hello = TlsHandshake::new(tls_version, HandshakeSide::Server);
            parse_server_hello(&mut hello, &mut r).then_some(hello)
        }
        _ => {
            debug!("tls: handshake type {} is not a hello", message_type);
            None
        }
    }
}

/// Maps a hello version to the client-side two-character label.
fn client_char_version(version: u16) -> Option<[u8; 2]> {
    // 0x0302 is labelled "11" here but "12" on the server side; kept as
    // found upstream, pending review
    match version {
        0x0002 => Some(*b"s2"),
        0x0300 => Some(*b"s3"),
        0x0301 => Some(*b"10"),
        0x0302 => Some(*b"11"),
        0x0303 => Some(*b"12"),
        0x0304 => Some(*b"13"),
        _ => None,
    }
}

fn server_char_version(version: u16) -> Option<[u8; 2]> {
    match version {
        0x0002 => Some(*b"s2"),
        0x0300 => Some(*b"s3"),
        0x0301 => Some(*b"10"),
        0x0302 => Some(*b"12"),
        0x0303 => Some(*b"12"),
        0x0304 => Some(*b"13"),
        _ => None,
    }
}

fn parse_client_hello(hello: &mut TlsHandshake, r: &mut ByteReader) -> bool {
    // version(2) random(32) sessionIDLen(1)
    if r.available() < 35 {
        return false;
    }
    let version = r.get_u16();
    r.skip(32);

    hello.protocol_version = version;
    match client_char_version(version) {
        Some(cv) => hello.char_version = cv,
        None => {
            debug!("tls: client hello version 0x{:x} out of range", version);
            return false;
        }
    }

    let session_id_len = r.get_u8() as usize;
    if r.available() < session_id_len + 2 {
        return false;
    }
    r.skip(session_id_len);

    let cipher_suite_len = r.get_u16() as usize;
    if r.available() < cipher_suite_len + 1 {
        return false;
    }
    let num_ciphers = cipher_suite_len >> 1;
    if num_ciphers == 0 {
        debug!("tls: client hello with no cipher suites");
        return false;
    }
    for _ in 0..num_ciphers {
        let cipher = r.get_u16();
        if !is_grease(cipher) {
            hello.cipher_suites.push(cipher);
        }
    }

    let compression_methods = r.get_u8() as usize;
    if r.available() < compression_methods + 2 {
        return false;
    }
    r.skip(compression_methods);

    let extension_length = r.get_u16() as usize;
    if r.available() < extension_length {
        return false;
    }

    parse_extensions(hello, r, extension_length)
}

fn parse_server_hello(hello: &mut TlsHandshake, r: &mut ByteReader) -> bool {
    if r.available() < 35 {
        return false;
    }
    let version = r.get_u16();
    r.skip(32);

    hello.protocol_version = version;
    match server_char_version(version) {
        Some(cv) => hello.char_version = cv,
        None => {
            debug!("tls: server hello version 0x{:x} out of range", version);
            return false;
        }
    }

    let session_id_len = r.get_u8() as usize;
    // sessionID + cipherSuite(2) + compression(1) + extensionLength(2)
    if r.available() < session_id_len + 5 {
        return false;
    }
    r.skip(session_id_len);

    let cipher = r.get_u16();
    hello.cipher_suites.push(cipher);

    r.skip(1); // compression method

    let extension_length = r.get_u16() as usize;
    if r.available() < extension_length {
        return false;
    }

    // server extensions: types recorded, payloads skipped
    let mut size_left = extension_length as i64;
    while size_left >= 4 {
        let ex_type = r.get_u16();
        let ex_length = r.get_u16() as usize;
        if r.is_error() {
            return false;
        }
        size_left -= 4 + ex_length as i64;
        if is_grease(ex_type) {
            if ex_length > 0 {
                r.skip(ex_length);
            }
            continue;
        }
        hello.extensions.push(ex_type);
        if ex_length > 0 {
            r.skip(ex_length);
        }
    }

    true
}

fn parse_extensions(hello: &mut TlsHandshake, r: &mut ByteReader, length: usize) -> bool {
    if length == 0 {
        debug!("tls: extension length is 0");
        return false;
    }

    let mut size_left = length as i64;
    while size_left >= 4 {
        let ex_type = r.get_u16();
        let ex_length = r.get_u16() as usize;
        if r.is_error() {
            return false;
        }

        if is_grease(ex_type) {
            size_left -= 4 + ex_length as i64;
            if ex_length > 0 {
                r.skip(ex_length);
            }
            continue;
        }

        if ex_length > r.available() {
            debug!("tls: extension length error, type {}", ex_type);
            return false;
        }

        hello.extensions.push(ex_type);
        let ok = match ex_type {
            0 => parse_sni(hello, r),
            10 => parse_elliptic_curves(hello, r),
            11 => parse_ec_point_formats(hello, r),
            13 => parse_signatures(hello, r),
            16 => parse_alpn(hello, r),
            _ => {
                if ex_length > 0 {
                    r.skip(ex_length);
                }
                true
            }
        };
        if !ok {
            return false;
        }
        size_left -= 4 + ex_length as i64;
    }

    true
}

fn parse_sni(hello: &mut TlsHandshake, r: &mut ByteReader) -> bool {
    let sni_list_length = r.get_u16() as usize;
    r.skip(1); // server name type, only host_name(0) in practice

    let sni_len = r.get_u16() as usize;
    if sni_len > r.available() || sni_len > 255 {
        debug!("tls: sni extension length error");
        return false;
    }
    let mut name = [0u8; 256];
    r.get_x(&mut name, sni_len);
    hello.sni_name = String::from_utf8_lossy(&name[..sni_len]).to_string();

    // only one host type supported; skip trailing list entries
    if sni_len + 3 < sni_list_length {
        r.skip(sni_list_length - sni_len - 3);
    }

    r.ok()
}

fn parse_elliptic_curves(hello: &mut TlsHandshake, r: &mut ByteReader) -> bool {
    let ecs_len = r.get_u16() as usize;
    if ecs_len > r.available() {
        debug!("tls: elliptic curves extension length error");
        return false;
    }
    for _ in 0..ecs_len >> 1 {
        let curve = r.get_u16();
        if !is_grease(curve) {
            hello.elliptic_curves.push(curve);
        }
    }
    r.ok()
}

fn parse_ec_point_formats(hello: &mut TlsHandshake, r: &mut ByteReader) -> bool {
    let ecsp_len = r.get_u8() as usize;
    if ecsp_len > r.available() {
        debug!("tls: ec point formats extension length error");
        return false;
    }
    for _ in 0..ecsp_len {
        let format = u16::from(r.get_u8());
        hello.ec_point_formats.push(format);
    }
    r.ok()
}

fn parse_signatures(hello: &mut TlsHandshake, r: &mut ByteReader) -> bool {
    let sig_len = r.get_u16() as usize;
    if sig_len > r.available() {
        debug!("tls: signatures extension length error");
        return false;
    }
    for _ in 0..sig_len >> 1 {
        let signature = r.get_u16();
        hello.signatures.push(signature);
    }
    r.ok()
}

fn parse_alpn(hello: &mut TlsHandshake, r: &mut ByteReader) -> bool {
    let alpn_length = r.get_u16() as usize;
    if alpn_length > r.available() {
        debug!("tls: alpn extension length error");
        return false;
    }

    // first protocol name is kept, the rest are skipped
    let mut alpn_cnt = 0usize;
    loop {
        let alpn_str_len = r.get_u8() as usize;
        if alpn_cnt == 0 {
            let mut name = [0u8; 256];
            r.get_x(&mut name, alpn_str_len.min(255));
            hello.alpn_name = String::from_utf8_lossy(&name[..alpn_str_len.min(255)]).to_string();
        } else {
            r.skip(alpn_str_len);
        }
        alpn_cnt += alpn_str_len + 1;
        if alpn_cnt >= alpn_length || r.is_error() {
            break;
        }
    }
    if r.is_error() {
        debug!("tls: alpn decoding error");
        return false;
    }
    true
}
