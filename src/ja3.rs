//! JA3 fingerprints of parsed TLS handshakes.
//!
//! The JA3 string is a canonical, decimal rendering of hello fields:
//! hyphen-separated lists, comma-separated groups. Clients contribute five
//! groups (version, ciphers, extensions, curves, EC point formats), servers
//! three (version, cipher, extensions). The fingerprint is the lowercase hex
//! MD5 of that string.

use crate::tls::{HandshakeSide, TlsHandshake};

fn join(values: &[u16]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// Canonical JA3 (client) / JA3S (server) string of a handshake.
pub fn ja3_string(hello: &TlsHandshake) -> String {
    let mut groups = vec![
        hello.protocol_version.to_string(),
        join(&hello.cipher_suites),
        join(&hello.extensions),
    ];
    if hello.side == HandshakeSide::Client {
        groups.push(join(&hello.elliptic_curves));
        groups.push(join(&hello.ec_point_formats));
    }
    groups.join(",")
}

/// Lowercase hex MD5 digest of the canonical string.
pub fn ja3_fingerprint(hello: &TlsHandshake) -> String {
    format!("{:x}", md5::compute(ja3_string(hello).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls;

    /// Firefox-style ClientHello to contile.services.mozilla.com, TLS 1.3.
    pub(crate) const MOZILLA_CLIENT_HELLO: &[u8] = &[
        0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00, 0x01, 0xfc, 0x03, 0x03, 0xec, 0xb2, 0x69,
        0x1a, 0xdd, 0xb2, 0xbf, 0x6c, 0x59, 0x9c, 0x7a, 0xaa, 0xe2, 0x3d, 0xe5, 0xf4, 0x25,
        0x61, 0xcc, 0x04, 0xeb, 0x41, 0x02, 0x9a, 0xcc, 0x6f, 0xc0, 0x50, 0xa1, 0x6a, 0xc1,
        0xd2, 0x20, 0x46, 0xf8, 0x61, 0x7b, 0x58, 0x0a, 0xc9, 0x35, 0x8e, 0x2a, 0xa4, 0x4e,
        0x30, 0x6d, 0x52, 0x46, 0x6b, 0xcc, 0x98, 0x9c, 0x87, 0xc8, 0xca, 0x64, 0x30, 0x9f,
        0x5f, 0xaf, 0x50, 0xba, 0x7b, 0x4d, 0x00, 0x22, 0x13, 0x01, 0x13, 0x03, 0x13, 0x02,
        0xc0, 0x2b, 0xc0, 0x2f, 0xcc, 0xa9, 0xcc, 0xa8, 0xc0, 0x2c, 0xc0, 0x30, 0xc0, 0x0a,
        0xc0, 0x09, 0xc0, 0x13, 0xc0, 0x14, 0x00, 0x9c, 0x00, 0x9d, 0x00, 0x2f, 0x00, 0x35,
        0x01, 0x00, 0x01, 0x91, 0x00, 0x00, 0x00, 0x21, 0x00, 0x1f, 0x00, 0x00, 0x1c, 0x63,
        0x6f, 0x6e, 0x74, 0x69, 0x6c, 0x65, 0x2e, 0x73, 0x65, 0x72, 0x76, 0x69, 0x63, 0x65,
        0x73, 0x2e, 0x6d, 0x6f, 0x7a, 0x69, 0x6c, 0x6c, 0x61, 0x2e, 0x63, 0x6f, 0x6d, 0x00,
        0x17, 0x00, 0x00, 0xff, 0x01, 0x00, 0x01, 0x00, 0x00, 0x0a, 0x00, 0x0e, 0x00, 0x0c,
        0x00, 0x1d, 0x00, 0x17, 0x00, 0x18, 0x00, 0x19, 0x01, 0x00, 0x01, 0x01, 0x00, 0x0b,
        0x00, 0x02, 0x01, 0x00, 0x00, 0x23, 0x00, 0x00, 0x00, 0x10, 0x00, 0x0e, 0x00, 0x0c,
        0x02, 0x68, 0x32, 0x08, 0x68, 0x74, 0x74, 0x70, 0x2f, 0x31, 0x2e, 0x31, 0x00, 0x05,
        0x00, 0x05, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x22, 0x00, 0x0a, 0x00, 0x08, 0x04,
        0x03, 0x05, 0x03, 0x06, 0x03, 0x02, 0x03, 0x00, 0x33, 0x00, 0x6b, 0x00, 0x69, 0x00,
        0x1d, 0x00, 0x20, 0x89, 0x09, 0x85, 0x8f, 0xbe, 0xb6, 0xed, 0x2f, 0x12, 0x48, 0xba,
        0x5b, 0x9e, 0x29, 0x78, 0xbe, 0xad, 0x0e, 0x84, 0x01, 0x10, 0x19, 0x2c, 0x61, 0xda,
        0xed, 0x00, 0x96, 0x79, 0x8b, 0x18, 0x44, 0x00, 0x17, 0x00, 0x41, 0x04, 0x4d, 0x18,
        0x3d, 0x91, 0xf5, 0xee, 0xd3, 0x57, 0x91, 0xfa, 0x98, 0x24, 0x64, 0xe3, 0xb0, 0x21,
        0x4a, 0xaa, 0x5f, 0x5d, 0x1b, 0x78, 0x61, 0x6d, 0x9b, 0x9f, 0xbe, 0xbc, 0x22, 0xd1,
        0x1f, 0x53, 0x5b, 0x2f, 0x94, 0xc6, 0x86, 0x14, 0x31, 0x36, 0xaa, 0x79, 0x5e, 0x6e,
        0x5a, 0x87, 0x5d, 0x6c, 0x08, 0x06, 0x4a, 0xd5, 0xb7, 0x6d, 0x44, 0xca, 0xad, 0x76,
        0x6e, 0x24, 0x83, 0x01, 0x27, 0x48, 0x00, 0x2b, 0x00, 0x05, 0x04, 0x03, 0x04, 0x03,
        0x03, 0x00, 0x0d, 0x00, 0x18, 0x00, 0x16, 0x04, 0x03, 0x05, 0x03, 0x06, 0x03, 0x08,
        0x04, 0x08, 0x05, 0x08, 0x06, 0x04, 0x01, 0x05, 0x01, 0x06, 0x01, 0x02, 0x03, 0x02,
        0x01, 0x00, 0x2d, 0x00, 0x02, 0x01, 0x01, 0x00, 0x1c, 0x00, 0x02, 0x40, 0x01, 0x00,
        0x15, 0x00, 0x7a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn mozilla_client_hello_ja3() {
        let hello = tls::parse(MOZILLA_CLIENT_HELLO).expect("client hello parses");
        assert_eq!(
            ja3_string(&hello),
            "771,4865-4867-4866-49195-49199-52393-52392-49196-49200-49162-49161-49171-49172-156-157-47-53,\
             0-23-65281-10-11-35-16-5-34-51-43-13-45-28-21,29-23-24-25-256-257,0"
        );
        assert_eq!(ja3_fingerprint(&hello), "579ccef312d18482fc42e2b822ca2430");
    }

    #[test]
    fn ja3_is_stable_across_reparses() {
        let a = tls::parse(MOZILLA_CLIENT_HELLO).unwrap();
        let b = tls::parse(MOZILLA_CLIENT_HELLO).unwrap();
        assert_eq!(ja3_fingerprint(&a), ja3_fingerprint(&b));
    }

    #[test]
    fn server_string_has_three_groups() {
        let hello = TlsHandshake {
            tls_version: 0x0303,
            protocol_version: 0x0303,
            char_version: *b"12",
            side: HandshakeSide::Server,
            cipher_suites: vec![4865],
            extensions: vec![43, 51],
            elliptic_curves: vec![],
            ec_point_formats: vec![],
            signatures: vec![],
            sni_name: String::new(),
            alpn_name: String::new(),
        };
        assert_eq!(ja3_string(&hello), "771,4865,43-51");
    }

    #[test]
    fn empty_lists_leave_empty_groups() {
        let hello = TlsHandshake {
            tls_version: 0x0301,
            protocol_version: 0x0301,
            char_version: *b"10",
            side: HandshakeSide::Client,
            cipher_suites: vec![10],
            extensions: vec![],
            elliptic_curves: vec![],
            ec_point_formats: vec![],
            signatures: vec![],
            sni_name: String::new(),
            alpn_name: String::new(),
        };
        assert_eq!(ja3_string(&hello), "769,10,,,");
    }
}
