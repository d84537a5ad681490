//! Parsers for the structured attribute values found in layout files: the
//! `calibfor` receiver tag and the whitespace separated number vectors used
//! by `eqfreq` and `eqgain`.

use nom::{
    bytes::complete::take_till,
    character::complete::{char, multispace0, multispace1},
    combinator::{all_consuming, map},
    error::Error,
    multi::{separated_list0, separated_list1},
    number::complete::float,
    sequence::{delimited, separated_pair},
    Finish, IResult,
};

/// One `name:value` entry of a `calibfor` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverAttr {
    /// Attribute name, e.g. `type`
    pub name: String,
    /// Attribute value
    pub value: String,
}

fn is_separator(c: char) -> bool {
    c == ':' || c == ','
}

fn parse_attr(s: &str) -> IResult<&str, ReceiverAttr> {
    map(
        separated_pair(take_till(is_separator), char(':'), take_till(is_separator)),
        |(name, value): (&str, &str)| ReceiverAttr {
            name: name.to_owned(),
            value: value.to_owned(),
        },
    )(s)
}

fn parse_calibfor(s: &str) -> IResult<&str, Vec<ReceiverAttr>> {
    all_consuming(separated_list1(char(','), parse_attr))(s)
}

fn parse_float_vec(s: &str) -> IResult<&str, Vec<f32>> {
    all_consuming(delimited(
        multispace0,
        separated_list0(multispace1, float),
        multispace0,
    ))(s)
}

/// Splits a `calibfor` tag such as `type:hoa2d,order:3` into its pairs.
/// Every comma separated entry must contain exactly one `:`.
pub fn decode_calibfor(s: &str) -> Result<Vec<ReceiverAttr>, Error<String>> {
    match parse_calibfor(s).finish() {
        Ok((_remaining, attrs)) => Ok(attrs),
        Err(Error { input, code }) => Err(Error {
            input: input.to_string(),
            code,
        }),
    }
}

/// Reads a whitespace separated list of numbers, as written by
/// [encode_float_vec]. An empty string is an empty vector.
pub fn decode_float_vec(s: &str) -> Result<Vec<f32>, Error<String>> {
    match parse_float_vec(s).finish() {
        Ok((_remaining, values)) => Ok(values),
        Err(Error { input, code }) => Err(Error {
            input: input.to_string(),
            code,
        }),
    }
}

/// Writes numbers with their shortest round-trip representation, so that
/// [decode_float_vec] gives back the identical values.
pub fn encode_float_vec(values: &[f32]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(name: &str, value: &str) -> ReceiverAttr {
        ReceiverAttr {
            name: name.to_owned(),
            value: value.to_owned(),
        }
    }

    #[test]
    fn single_pair() {
        assert_eq!(decode_calibfor("type:nsp").unwrap(), vec![attr("type", "nsp")]);
    }

    #[test]
    fn several_pairs() {
        assert_eq!(
            decode_calibfor("type:hoa2d,order:3,decoder:maxre").unwrap(),
            vec![
                attr("type", "hoa2d"),
                attr("order", "3"),
                attr("decoder", "maxre")
            ]
        );
    }

    #[test]
    fn empty_value_is_a_pair() {
        assert_eq!(decode_calibfor("type:").unwrap(), vec![attr("type", "")]);
    }

    #[test]
    fn malformed_tags() {
        assert!(decode_calibfor("type").is_err());
        assert!(decode_calibfor("type:nsp:vbap").is_err());
        assert!(decode_calibfor("type:nsp,").is_err());
        assert!(decode_calibfor("type:nsp,order").is_err());
        assert!(decode_calibfor("").is_err());
    }

    #[test]
    fn float_vectors() {
        assert_eq!(decode_float_vec("").unwrap(), Vec::<f32>::new());
        assert_eq!(decode_float_vec("  ").unwrap(), Vec::<f32>::new());
        assert_eq!(
            decode_float_vec("62.5 78.74 -3.25").unwrap(),
            vec![62.5, 78.74, -3.25]
        );
        assert!(decode_float_vec("62.5 abc").is_err());
    }

    #[test]
    fn encoded_vectors_read_back_identically() {
        let values = vec![62.5_f32, 78.745_07, 99.212_55, -0.000_123, 0.0];
        let decoded = decode_float_vec(&encode_float_vec(&values)).unwrap();
        assert_eq!(values, decoded);
    }
}
