//! MIME types carried in the `meta` of success headers.

use nom::{
    IResult, Parser,
    bytes::complete::{take_while, take_while1},
    character::complete::char,
    combinator::{all_consuming, opt},
    multi::many0,
    sequence::{delimited, preceded, separated_pair},
};
use std::fmt;

/// The MIME type assumed when a success response has an empty `meta`.
pub const DEFAULT_MIME_TYPE: &str = "text/gemini; charset=utf-8";

/// A MIME type, as carried in the `meta` of a success response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeType {
    /// The top-level type, lowercased (`text`).
    pub kind: String,
    /// The subtype, lowercased (`gemini`).
    pub subtype: String,
    /// Parameters in the order they appeared. Keys are lowercased.
    pub params: Vec<(String, String)>,
}

fn is_token(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$&-^_.+".contains(c)
}

fn is_space(c: char) -> bool {
    c == ' ' || c == '\t'
}

impl MimeType {
    /// Parse a MIME type such as `text/gemini; charset=utf-8; lang=en`.
    pub fn parse(input: &str) -> Option<Self> {
        all_consuming(delimited(take_while(is_space), Self::mime_type, take_while(is_space)))
            .parse(input)
            .ok()
            .map(|(_, mime)| mime)
    }

    fn param(input: &str) -> IResult<&str, (String, String)> {
        let value = nom::branch::alt((
            delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
            take_while1(is_token),
        ));
        let (input, (key, value)) = preceded(
            (take_while(is_space), char(';'), take_while(is_space)),
            separated_pair(take_while1(is_token), char('='), value),
        )
        .parse(input)?;

        Ok((input, (key.to_ascii_lowercase(), value.to_string())))
    }

    fn mime_type(input: &str) -> IResult<&str, Self> {
        let (input, (kind, subtype)) =
            separated_pair(take_while1(is_token), char('/'), take_while1(is_token)).parse(input)?;
        let (input, params) = many0(Self::param).parse(input)?;
        // a lone trailing `;` is tolerated
        let (input, _) = opt(preceded(take_while(is_space), char(';'))).parse(input)?;

        let mime = Self {
            kind: kind.to_ascii_lowercase(),
            subtype: subtype.to_ascii_lowercase(),
            params,
        };
        Ok((input, mime))
    }

    /// `type/subtype`, without parameters.
    pub fn essence(&self) -> String {
        format!("{}/{}", self.kind, self.subtype)
    }

    /// Look up a parameter by (case-insensitive) name.
    pub fn param_value(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// The `charset` parameter. Gemini defaults it to UTF-8 for `text/*`.
    pub fn charset(&self) -> Option<&str> {
        match self.param_value("charset") {
            Some(charset) => Some(charset),
            None if self.kind == "text" => Some("utf-8"),
            None => None,
        }
    }

    /// The `lang` parameter of `text/gemini` documents.
    pub fn lang(&self) -> Option<&str> {
        self.param_value("lang")
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.subtype)?;
        for (key, value) in &self.params {
            if value.chars().all(is_token) && !value.is_empty() {
                write!(f, "; {key}={value}")?;
            } else {
                write!(f, "; {key}=\"{value}\"")?;
            }
        }
        Ok(())
    }
}
