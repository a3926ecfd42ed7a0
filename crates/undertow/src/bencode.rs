//! Bencode, the self-describing binary serialization format of BitTorrent.
//!
//! Every torrent file, extension handshake and metadata message is framed
//! with this format. Decoding returns the number of bytes consumed along
//! with the value, so that a bencoded prefix can be followed by raw payload
//! bytes, as the metadata extension does.

use std::collections::BTreeMap;

use crate::error::Error;

/// A bencoded value.
///
/// Dictionary keys are raw byte strings. A `BTreeMap` keeps them sorted
/// lexicographically, which makes the encoding canonical: the SHA-1 of an
/// encoded info dictionary must reproduce the exact bytes any compliant
/// encoder would produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    ByteString(Vec<u8>),
    List(Vec<Value>),
    Dictionary(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Decode one value from the front of `buf`, returning it together with
    /// the exact count of bytes consumed. Trailing bytes are left alone.
    pub fn decode(buf: &[u8]) -> Result<(Value, usize), Error> {
        match buf.first() {
            None => Err(Error::BencodeDecode("empty input".into())),
            Some(b'i') => decode_integer(buf),
            Some(b'0'..=b'9') => {
                let (s, n) = decode_byte_string(buf)?;
                Ok((Value::ByteString(s), n))
            }
            Some(b'l') => decode_list(buf),
            Some(b'd') => decode_dictionary(buf),
            Some(c) => Err(Error::BencodeDecode(format!(
                "invalid leading byte {:#04x}, must be 'i', 'l', 'd' or a \
                 digit",
                c
            ))),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Integer(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::ByteString(s) => {
                out.extend_from_slice(s.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(s);
            }
            Value::List(l) => {
                out.push(b'l');
                for v in l {
                    v.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dictionary(d) => {
                out.push(b'd');
                // BTreeMap iterates keys in lexicographic byte order, the
                // canonical form required for info-hash stability.
                for (k, v) in d {
                    out.extend_from_slice(k.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(k);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::ByteString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::ByteString(s) => std::str::from_utf8(s).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup by key. None for non-dictionaries too.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::ByteString(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::ByteString(v.as_bytes().to_vec())
    }
}

fn decode_integer(buf: &[u8]) -> Result<(Value, usize), Error> {
    let end = buf
        .iter()
        .position(|&b| b == b'e')
        .ok_or_else(|| Error::BencodeDecode("integer missing 'e'".into()))?;

    let digits = std::str::from_utf8(&buf[1..end])
        .map_err(|_| Error::BencodeDecode("integer is not ASCII".into()))?;

    let value = digits.parse::<i64>().map_err(|e| {
        Error::BencodeDecode(format!("invalid integer {digits:?}: {e}"))
    })?;

    Ok((Value::Integer(value), end + 1))
}

fn decode_byte_string(buf: &[u8]) -> Result<(Vec<u8>, usize), Error> {
    let colon = buf
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| Error::BencodeDecode("string missing ':'".into()))?;

    let len = std::str::from_utf8(&buf[..colon])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| {
            Error::BencodeDecode("invalid string length prefix".into())
        })?;

    let start = colon + 1;
    if buf.len() < start + len {
        return Err(Error::BencodeDecode(format!(
            "string length {len} exceeds remaining {} bytes",
            buf.len() - start
        )));
    }

    Ok((buf[start..start + len].to_vec(), start + len))
}

fn decode_list(buf: &[u8]) -> Result<(Value, usize), Error> {
    let mut consumed = 1;
    let mut items = Vec::new();

    loop {
        match buf.get(consumed) {
            None => {
                return Err(Error::BencodeDecode("list missing 'e'".into()))
            }
            Some(b'e') => return Ok((Value::List(items), consumed + 1)),
            Some(_) => {
                let (item, n) = Value::decode(&buf[consumed..])?;
                items.push(item);
                consumed += n;
            }
        }
    }
}

fn decode_dictionary(buf: &[u8]) -> Result<(Value, usize), Error> {
    let mut consumed = 1;
    let mut map = BTreeMap::new();

    loop {
        match buf.get(consumed) {
            None => {
                return Err(Error::BencodeDecode(
                    "dictionary missing 'e'".into(),
                ))
            }
            Some(b'e') => {
                return Ok((Value::Dictionary(map), consumed + 1))
            }
            Some(_) => {
                let (key, n) = decode_byte_string(&buf[consumed..])
                    .map_err(|e| {
                        Error::BencodeDecode(format!(
                            "dictionary key: {e}"
                        ))
                    })?;
                consumed += n;

                let (value, n) = Value::decode(&buf[consumed..])?;
                consumed += n;

                map.insert(key, value);
            }
        }
    }
}
