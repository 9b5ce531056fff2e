//! Minimal BER/DER reader.
//!
//! Just enough ASN.1 to walk an X.509 certificate down to its
//! `SubjectPublicKeyInfo` without pulling in a certificate library. Every
//! length read is checked against the remaining input; malformed input is an
//! [`Asn1Error`], never a panic or a silently truncated value.

use base64::Engine;
use thiserror::Error;

/// Nesting limit for indefinite-length constructed values.
const MAX_DEPTH: usize = 32;

/// OID of `rsaEncryption`.
pub const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";

/// What went wrong while decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Asn1ErrorKind {
    /// Input ended inside a tag, length, or value.
    UnexpectedEof,
    /// Length octets use a reserved form or more bytes than supported.
    InvalidLength,
    /// Tag number does not fit in 32 bits.
    TagOverflow,
    /// A primitive value used indefinite length.
    IndefinitePrimitive,
    /// Indefinite-length value without end-of-contents marker.
    MissingEndOfContents,
    /// Indefinite-length values nest too deeply.
    DepthExceeded,
    /// A structural element was not what the certificate layout requires.
    UnexpectedTag {
        /// What the layout requires.
        expected: &'static str,
        /// Tag found instead.
        found: Tag,
    },
    /// A structure is missing a required child.
    MissingElement(&'static str),
    /// Bytes remained after the outermost value.
    TrailingData,
    /// OBJECT IDENTIFIER content is not a valid base-128 run.
    InvalidOid,
    /// BIT STRING declares unused bits in a key.
    UnalignedBitString,
    /// PEM armour could not be removed.
    InvalidPem(String),
}

/// A decoding failure at a byte offset of the input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ASN.1 parse error at offset {offset}: {kind:?}")]
pub struct Asn1Error {
    /// Offset into the outermost input.
    pub offset: usize,
    /// Failure kind.
    pub kind: Asn1ErrorKind,
}

impl Asn1Error {
    fn at(offset: usize, kind: Asn1ErrorKind) -> Self {
        Self { offset, kind }
    }
}

type Result<T> = std::result::Result<T, Asn1Error>;

/// Tag class bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    /// Universal (0b00).
    Universal,
    /// Application (0b01).
    Application,
    /// Context-specific (0b10).
    ContextSpecific,
    /// Private (0b11).
    Private,
}

/// Identifier octets of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    /// Tag class.
    pub class: TagClass,
    /// Structured (constructed) bit.
    pub constructed: bool,
    /// Tag number.
    pub number: u32,
}

impl Tag {
    /// Universal INTEGER.
    pub const INTEGER: Tag = Tag::universal(false, 2);
    /// Universal BIT STRING.
    pub const BIT_STRING: Tag = Tag::universal(false, 3);
    /// Universal NULL.
    pub const NULL: Tag = Tag::universal(false, 5);
    /// Universal OBJECT IDENTIFIER.
    pub const OBJECT_IDENTIFIER: Tag = Tag::universal(false, 6);
    /// Universal SEQUENCE.
    pub const SEQUENCE: Tag = Tag::universal(true, 16);

    const fn universal(constructed: bool, number: u32) -> Self {
        Tag {
            class: TagClass::Universal,
            constructed,
            number,
        }
    }

    fn is_end_of_contents(self) -> bool {
        self.class == TagClass::Universal && !self.constructed && self.number == 0
    }
}

/// One decoded tag-length-value.
#[derive(Debug, Clone, Copy)]
pub struct Node<'a> {
    /// Identifier.
    pub tag: Tag,
    /// Absolute offset of the identifier octets.
    pub offset: usize,
    /// Value octets (without the end-of-contents marker).
    pub content: &'a [u8],
    /// Full encoding including identifier and length octets.
    pub raw: &'a [u8],
    content_offset: usize,
}

impl<'a> Node<'a> {
    /// Decode exactly one value spanning all of `input`.
    ///
    /// # Errors
    /// Fails on malformed encodings or trailing bytes.
    pub fn parse(input: &'a [u8]) -> Result<Node<'a>> {
        let (node, used) = read_node(input, 0, 0)?;
        if used != input.len() {
            return Err(Asn1Error::at(used, Asn1ErrorKind::TrailingData));
        }
        Ok(node)
    }

    /// Decode the children of a constructed value.
    ///
    /// # Errors
    /// Fails on malformed children.
    pub fn children(&self) -> Result<Vec<Node<'a>>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < self.content.len() {
            let (child, used) = read_node(&self.content[pos..], self.content_offset + pos, 0)?;
            out.push(child);
            pos += used;
        }
        Ok(out)
    }

    /// Fail unless the tag is `expected`.
    ///
    /// # Errors
    /// Returns `UnexpectedTag` naming `what`.
    pub fn expect(&self, expected: Tag, what: &'static str) -> Result<&Self> {
        if self.tag == expected {
            Ok(self)
        } else {
            Err(Asn1Error::at(
                self.offset,
                Asn1ErrorKind::UnexpectedTag {
                    expected: what,
                    found: self.tag,
                },
            ))
        }
    }

    /// Decode an OBJECT IDENTIFIER into dotted-decimal form.
    ///
    /// # Errors
    /// Fails if the tag is not OBJECT IDENTIFIER or the content is invalid.
    pub fn oid(&self) -> Result<String> {
        self.expect(Tag::OBJECT_IDENTIFIER, "OBJECT IDENTIFIER")?;
        decode_oid(self.content).ok_or(Asn1Error::at(self.offset, Asn1ErrorKind::InvalidOid))
    }
}

fn read_node(input: &[u8], base: usize, depth: usize) -> Result<(Node<'_>, usize)> {
    if depth > MAX_DEPTH {
        return Err(Asn1Error::at(base, Asn1ErrorKind::DepthExceeded));
    }

    let (tag, mut pos) = read_tag(input, base)?;
    let length = read_length(&input[pos..], base + pos)?;
    pos += length.octets;

    match length.value {
        Some(len) => {
            let end = pos
                .checked_add(len)
                .filter(|end| *end <= input.len())
                .ok_or(Asn1Error::at(base + pos, Asn1ErrorKind::UnexpectedEof))?;
            Ok((
                Node {
                    tag,
                    offset: base,
                    content: &input[pos..end],
                    raw: &input[..end],
                    content_offset: base + pos,
                },
                end,
            ))
        }
        None => {
            if !tag.constructed {
                return Err(Asn1Error::at(base, Asn1ErrorKind::IndefinitePrimitive));
            }
            let start = pos;
            loop {
                if pos >= input.len() {
                    return Err(Asn1Error::at(
                        base + pos,
                        Asn1ErrorKind::MissingEndOfContents,
                    ));
                }
                let (child, used) = read_node(&input[pos..], base + pos, depth + 1)?;
                if child.tag.is_end_of_contents() && child.content.is_empty() {
                    let node = Node {
                        tag,
                        offset: base,
                        content: &input[start..pos],
                        raw: &input[..pos + used],
                        content_offset: base + start,
                    };
                    return Ok((node, pos + used));
                }
                pos += used;
            }
        }
    }
}

fn read_tag(input: &[u8], base: usize) -> Result<(Tag, usize)> {
    let first = *input
        .first()
        .ok_or(Asn1Error::at(base, Asn1ErrorKind::UnexpectedEof))?;

    let class = match first >> 6 {
        0 => TagClass::Universal,
        1 => TagClass::Application,
        2 => TagClass::ContextSpecific,
        _ => TagClass::Private,
    };
    let constructed = first & 0x20 != 0;

    if first & 0x1f != 0x1f {
        let number = u32::from(first & 0x1f);
        return Ok((
            Tag {
                class,
                constructed,
                number,
            },
            1,
        ));
    }

    // High-tag-number form: base-128, high bit set on all but the last octet.
    let mut number: u32 = 0;
    let mut pos = 1;
    loop {
        let byte = *input
            .get(pos)
            .ok_or(Asn1Error::at(base + pos, Asn1ErrorKind::UnexpectedEof))?;
        number = number
            .checked_mul(128)
            .and_then(|n| n.checked_add(u32::from(byte & 0x7f)))
            .ok_or(Asn1Error::at(base + pos, Asn1ErrorKind::TagOverflow))?;
        pos += 1;
        if byte & 0x80 == 0 {
            break;
        }
    }

    Ok((
        Tag {
            class,
            constructed,
            number,
        },
        pos,
    ))
}

struct Length {
    /// `None` for the indefinite form.
    value: Option<usize>,
    octets: usize,
}

fn read_length(input: &[u8], base: usize) -> Result<Length> {
    let first = *input
        .first()
        .ok_or(Asn1Error::at(base, Asn1ErrorKind::UnexpectedEof))?;

    if first & 0x80 == 0 {
        return Ok(Length {
            value: Some(usize::from(first)),
            octets: 1,
        });
    }

    let count = usize::from(first & 0x7f);
    if count == 0 {
        return Ok(Length {
            value: None,
            octets: 1,
        });
    }
    if count > 4 {
        return Err(Asn1Error::at(base, Asn1ErrorKind::InvalidLength));
    }

    let bytes = input
        .get(1..=count)
        .ok_or(Asn1Error::at(base + 1, Asn1ErrorKind::UnexpectedEof))?;
    let value = bytes
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));

    Ok(Length {
        value: Some(value),
        octets: 1 + count,
    })
}

fn decode_oid(content: &[u8]) -> Option<String> {
    if content.is_empty() || content[content.len() - 1] & 0x80 != 0 {
        return None;
    }

    let mut arcs: Vec<u64> = Vec::new();
    let mut value: u64 = 0;
    for byte in content {
        value = value.checked_mul(128)?.checked_add(u64::from(byte & 0x7f))?;
        if byte & 0x80 == 0 {
            if arcs.is_empty() {
                let (first, second) = match value {
                    0..=39 => (0, value),
                    40..=79 => (1, value - 40),
                    _ => (2, value - 80),
                };
                arcs.push(first);
                arcs.push(second);
            } else {
                arcs.push(value);
            }
            value = 0;
        }
    }

    Some(
        arcs.iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join("."),
    )
}

/// The public key portion of a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyInfo {
    /// The full SPKI encoding.
    pub spki: Vec<u8>,
    /// Algorithm OID, dotted decimal.
    pub algorithm: String,
    /// Key bytes from the BIT STRING (for RSA, a PKCS#1 `RSAPublicKey`).
    pub public_key: Vec<u8>,
}

/// Walk `Certificate → TBSCertificate → SubjectPublicKeyInfo`.
///
/// # Errors
/// Fails if `der` is not a well-formed certificate.
pub fn subject_public_key_info(der: &[u8]) -> Result<PublicKeyInfo> {
    let cert = Node::parse(der)?;
    cert.expect(Tag::SEQUENCE, "Certificate SEQUENCE")?;

    let parts = cert.children()?;
    let tbs = parts
        .first()
        .ok_or(Asn1Error::at(cert.offset, Asn1ErrorKind::MissingElement("tbsCertificate")))?;
    tbs.expect(Tag::SEQUENCE, "TBSCertificate SEQUENCE")?;

    let fields = tbs.children()?;
    // version is an optional explicit [0]
    let skip = match fields.first() {
        Some(f) if f.tag.class == TagClass::ContextSpecific && f.tag.number == 0 => 1,
        _ => 0,
    };
    // serialNumber, signature, issuer, validity, subject, subjectPublicKeyInfo
    let spki = fields.get(skip + 5).ok_or(Asn1Error::at(
        tbs.offset,
        Asn1ErrorKind::MissingElement("subjectPublicKeyInfo"),
    ))?;
    spki.expect(Tag::SEQUENCE, "SubjectPublicKeyInfo SEQUENCE")?;

    parse_spki(spki)
}

/// Decode a bare `SubjectPublicKeyInfo` encoding.
///
/// # Errors
/// Fails if `der` is not a well-formed SPKI.
pub fn parse_subject_public_key_info(der: &[u8]) -> Result<PublicKeyInfo> {
    let spki = Node::parse(der)?;
    spki.expect(Tag::SEQUENCE, "SubjectPublicKeyInfo SEQUENCE")?;
    parse_spki(&spki)
}

fn parse_spki(spki: &Node<'_>) -> Result<PublicKeyInfo> {
    let parts = spki.children()?;
    let (alg, bits) = match parts.as_slice() {
        [alg, bits] => (alg, bits),
        _ => {
            return Err(Asn1Error::at(
                spki.offset,
                Asn1ErrorKind::MissingElement("algorithm and subjectPublicKey"),
            ));
        }
    };

    alg.expect(Tag::SEQUENCE, "AlgorithmIdentifier SEQUENCE")?;
    let alg_parts = alg.children()?;
    let oid = alg_parts
        .first()
        .ok_or(Asn1Error::at(alg.offset, Asn1ErrorKind::MissingElement("algorithm")))?
        .oid()?;

    bits.expect(Tag::BIT_STRING, "BIT STRING")?;
    let (unused, key) = bits
        .content
        .split_first()
        .ok_or(Asn1Error::at(bits.offset, Asn1ErrorKind::UnexpectedEof))?;
    if *unused != 0 {
        return Err(Asn1Error::at(bits.offset, Asn1ErrorKind::UnalignedBitString));
    }

    Ok(PublicKeyInfo {
        spki: spki.raw.to_vec(),
        algorithm: oid,
        public_key: key.to_vec(),
    })
}

/// Strip PEM armour and decode the base64 body.
///
/// # Errors
/// Fails if markers are missing or the body is not base64.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .skip_while(|l| !l.starts_with("-----BEGIN "))
        .skip(1)
        .take_while(|l| !l.starts_with("-----END "))
        .collect();

    if body.is_empty() {
        return Err(Asn1Error::at(
            0,
            Asn1ErrorKind::InvalidPem("no PEM body found".to_string()),
        ));
    }

    base64::engine::general_purpose::STANDARD
        .decode(body.as_bytes())
        .map_err(|e| Asn1Error::at(0, Asn1ErrorKind::InvalidPem(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CERT_PEM: &str = include_str!("../tests/fixtures/signing_cert.pem");

    #[test]
    fn short_and_long_lengths() {
        let short = [0x04, 0x02, 0xaa, 0xbb];
        let node = Node::parse(&short).unwrap();
        assert_eq!(node.content, &[0xaa, 0xbb]);

        let mut long = vec![0x04, 0x81, 0x80];
        long.extend(std::iter::repeat_n(0x11, 0x80));
        let node = Node::parse(&long).unwrap();
        assert_eq!(node.content.len(), 0x80);
    }

    #[test]
    fn high_tag_number() {
        // [APPLICATION 201] primitive, two tag octets: 0x81 0x49
        let bytes = [0x5f, 0x81, 0x49, 0x01, 0x00];
        let node = Node::parse(&bytes).unwrap();
        assert_eq!(node.tag.class, TagClass::Application);
        assert_eq!(node.tag.number, 201);
        assert!(!node.tag.constructed);
    }

    #[test]
    fn indefinite_length_sequence() {
        let bytes = [0x30, 0x80, 0x02, 0x01, 0x05, 0x05, 0x00, 0x00, 0x00];
        let node = Node::parse(&bytes).unwrap();
        let children = node.children().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].tag, Tag::INTEGER);
        assert_eq!(children[1].tag, Tag::NULL);
    }

    #[test]
    fn indefinite_primitive_is_rejected() {
        let err = Node::parse(&[0x04, 0x80, 0x00, 0x00]).unwrap_err();
        assert_eq!(err.kind, Asn1ErrorKind::IndefinitePrimitive);
    }

    #[test]
    fn missing_end_of_contents() {
        let err = Node::parse(&[0x30, 0x80, 0x05, 0x00]).unwrap_err();
        assert_eq!(err.kind, Asn1ErrorKind::MissingEndOfContents);
    }

    #[test]
    fn length_past_end_is_eof() {
        let err = Node::parse(&[0x30, 0x05, 0x02, 0x01]).unwrap_err();
        assert_eq!(err.kind, Asn1ErrorKind::UnexpectedEof);
    }

    #[test]
    fn trailing_data_is_rejected() {
        let err = Node::parse(&[0x05, 0x00, 0xff]).unwrap_err();
        assert_eq!(err.kind, Asn1ErrorKind::TrailingData);
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn oid_decoding() {
        let rsa = [0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];
        assert_eq!(Node::parse(&rsa).unwrap().oid().unwrap(), OID_RSA_ENCRYPTION);

        let ed25519 = [0x06, 0x03, 0x2b, 0x65, 0x70];
        assert_eq!(Node::parse(&ed25519).unwrap().oid().unwrap(), "1.3.101.112");

        let dangling = [0x06, 0x02, 0x2a, 0x86];
        assert_eq!(
            Node::parse(&dangling).unwrap().oid().unwrap_err().kind,
            Asn1ErrorKind::InvalidOid
        );
    }

    #[test]
    fn certificate_spki() {
        let der = pem_to_der(CERT_PEM).unwrap();
        let info = subject_public_key_info(&der).unwrap();
        assert_eq!(info.algorithm, OID_RSA_ENCRYPTION);
        // RSAPublicKey ::= SEQUENCE { modulus INTEGER, publicExponent INTEGER }
        let key = Node::parse(&info.public_key).unwrap();
        let ints = key.children().unwrap();
        assert_eq!(ints.len(), 2);
        assert_eq!(ints[1].content, &[0x01, 0x00, 0x01]);

        let again = parse_subject_public_key_info(&info.spki).unwrap();
        assert_eq!(again, info);
    }

    #[test]
    fn truncated_certificate_fails() {
        let der = pem_to_der(CERT_PEM).unwrap();
        for cut in [1, 10, der.len() / 2, der.len() - 1] {
            assert!(subject_public_key_info(&der[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn pem_without_body() {
        let err = pem_to_der("not a pem").unwrap_err();
        assert!(matches!(err.kind, Asn1ErrorKind::InvalidPem(_)));
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            if let Ok(node) = Node::parse(&bytes) {
                prop_assert!(node.raw.len() == bytes.len());
                let _ = node.children();
            }
            let _ = subject_public_key_info(&bytes);
        }

        #[test]
        fn corrupted_certificate_never_panics(index in 0usize..778, value in any::<u8>()) {
            let mut der = pem_to_der(CERT_PEM).unwrap();
            let index = index % der.len();
            der[index] = value;
            let _ = subject_public_key_info(&der);
        }
    }
}
