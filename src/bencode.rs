use crate::error::Error;

use nom::branch::alt;
use nom::bytes::complete::take;
use nom::character::complete::{char, digit1};
use nom::combinator::{map, map_res, opt, recognize};
use nom::multi::many0;
use nom::sequence::{delimited, pair, terminated};
use nom::IResult;

use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ParseError {
    Incomplete,
    Invalid(nom::error::ErrorKind),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ParseError::Incomplete => write!(f, "bencode parse requires more data"),
            ParseError::Invalid(kind) => write!(f, "bencode parse error: {:?}", kind),
        }
    }
}

impl std::error::Error for ParseError {}

/// A decoded bencode value.
///
/// Dictionaries keep their entries in encoded order so that re-encoding a
/// decoded value is byte-exact; this is what makes infohash computation over
/// the `info` dict deterministic. Keys are raw bytes, compared exactly.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Value {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Vec<(Vec<u8>, Value)>),
}

pub fn decode(input: &[u8]) -> Result<Value, ParseError> {
    match bval(input) {
        Ok((_, value)) => Ok(value),
        Err(nom::Err::Incomplete(_)) => Err(ParseError::Incomplete),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(ParseError::Invalid(e.code)),
    }
}

impl Value {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Integer(v) => {
                out.push(b'i');
                out.extend_from_slice(v.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(v) => {
                out.extend_from_slice(v.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(v);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(entries) => {
                out.push(b'd');
                for (key, item) in entries {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    item.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Linear scan over dictionary entries, first match wins.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(entries) => entries
                .iter()
                .find(|(k, _)| k.as_slice() == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64, Error> {
        match self.get(key.as_bytes()) {
            Some(Value::Integer(v)) => Ok(*v),
            _ => Err(Error::ValueTypeMissingOrInvalid(key.into())),
        }
    }

    pub fn get_bytes(&self, key: &str) -> Result<&[u8], Error> {
        match self.get(key.as_bytes()) {
            Some(Value::Bytes(v)) => Ok(v),
            _ => Err(Error::ValueTypeMissingOrInvalid(key.into())),
        }
    }

    pub fn get_list(&self, key: &str) -> Result<&[Value], Error> {
        match self.get(key.as_bytes()) {
            Some(Value::List(v)) => Ok(v),
            _ => Err(Error::ValueTypeMissingOrInvalid(key.into())),
        }
    }

    pub fn get_dict(&self, key: &str) -> Result<&Value, Error> {
        match self.get(key.as_bytes()) {
            Some(v @ Value::Dict(_)) => Ok(v),
            _ => Err(Error::ValueTypeMissingOrInvalid(key.into())),
        }
    }
}

impl From<&Value> for Vec<u8> {
    fn from(value: &Value) -> Self {
        let mut out = Vec::new();
        value.encode_into(&mut out);
        out
    }
}

fn to_number<T: FromStr<Err = std::num::ParseIntError>>(input: &[u8]) -> Result<T, std::io::Error> {
    let input_str = String::from_utf8_lossy(input);
    input_str
        .parse::<T>()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
}

fn bint(input: &[u8]) -> IResult<&[u8], i64> {
    delimited(
        char('i'),
        map_res(recognize(pair(opt(char('-')), digit1)), to_number::<i64>),
        char('e'),
    )(input)
}

fn bbytes(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    let (input, length) = map_res(terminated(digit1, char(':')), to_number::<usize>)(input)?;
    let (input, data) = take(length)(input)?;
    Ok((input, data.to_vec()))
}

fn blist(input: &[u8]) -> IResult<&[u8], Vec<Value>> {
    delimited(char('l'), many0(bval), char('e'))(input)
}

fn bdict(input: &[u8]) -> IResult<&[u8], Vec<(Vec<u8>, Value)>> {
    delimited(char('d'), many0(pair(bbytes, bval)), char('e'))(input)
}

fn bval(input: &[u8]) -> IResult<&[u8], Value> {
    alt((
        map(bint, Value::Integer),
        map(bbytes, Value::Bytes),
        map(blist, Value::List),
        map(bdict, Value::Dict),
    ))(input)
}
