//! Implements a parser for the line-based command protocol.
use crate::types::protocol::{AddJobArgs, Command};
use crate::types::serialisable::WireSerialisable;

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParsingError {
    #[error("syntax error")]
    BadFormat,
    #[error("unknown command")]
    UnknownCommand,
}

impl WireSerialisable for ParsingError {
    fn serialise_wire(&self) -> Vec<u8> {
        match self {
            ParsingError::BadFormat => b"-ERR syntax error\r\n".to_vec(),
            ParsingError::UnknownCommand => {
                b"-ERR unknown command\r\n".to_vec()
            },
        }
    }
}

/// Provides a custom, minimal, zero-copy parser of byte slices.
struct ParseState<'a> {
    from: &'a [u8],
}

impl ParseState<'_> {
    /// Asserts there's no more input to take, returning `result` if so, and a
    /// `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.is_done() {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    fn is_done(&self) -> bool {
        self.from.is_empty()
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&[u8], ParsingError> {
        let token = self.next_token().ok_or(ParsingError::BadFormat)?;

        if token.is_empty() {
            Err(ParsingError::BadFormat)
        } else {
            Ok(token)
        }
    }

    /// Consumes from the input, expecting a space then a (possibly negative)
    /// i64.
    fn expect_next_i64(&mut self) -> Result<i64, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;
        let (negative, digits) = match token {
            [b'-', rest @ ..] => (true, rest),
            _ => (false, token),
        };

        if digits.is_empty() {
            return Err(ParsingError::BadFormat);
        }

        let mut r = 0i64;
        for v in digits {
            let digit = match v {
                b'0'..=b'9' => (*v - b'0') as i64,
                _ => return Err(ParsingError::BadFormat),
            };

            // Accumulating towards the sign lets i64::MIN parse.
            r = r.checked_mul(10).ok_or(ParsingError::BadFormat)?;
            r = if negative {
                r.checked_sub(digit)
            } else {
                r.checked_add(digit)
            }
            .ok_or(ParsingError::BadFormat)?;
        }

        Ok(r)
    }

    /// Consumes from the input, expecting a space then any non-empty run of
    /// bytes other than space.
    fn expect_next_bytes(&mut self) -> Result<Vec<u8>, ParsingError> {
        self.expect_space()?;
        Ok(self.expect_next_token()?.to_vec())
    }

    /// Consumes a space.
    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.first() {
            Some(b' ') => {
                self.from = &self.from[1..];
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes from this ParseState until reaching a space byte or the end of
    /// the input. It returns None at the end of the input. On consecutive space
    /// bytes, it returns a zero-length slice.
    fn next_token(&mut self) -> Option<&[u8]> {
        if self.from.is_empty() {
            return None;
        }

        let idx = self
            .from
            .iter()
            .position(|c| *c == b' ')
            .unwrap_or(self.from.len());

        let token = &self.from[..idx];
        self.from = &self.from[idx..];

        Some(token)
    }

    /// Parses the trailing `ADDJOB` options. Later options override earlier
    /// ones.
    fn expect_addjob_options(
        &mut self,
        args: &mut AddJobArgs,
    ) -> Result<(), ParsingError> {
        while !self.is_done() {
            self.expect_space()?;
            let opt = self.expect_next_token()?;

            if opt.eq_ignore_ascii_case(b"replicate") {
                args.replicate = Some(self.expect_next_i64()?);
            } else if opt.eq_ignore_ascii_case(b"ttl") {
                args.ttl = Some(self.expect_next_i64()?);
            } else if opt.eq_ignore_ascii_case(b"retry") {
                args.retry = Some(self.expect_next_i64()?);
            } else if opt.eq_ignore_ascii_case(b"async") {
                args.asynchronous = true;
            } else {
                return Err(ParsingError::BadFormat);
            }
        }

        Ok(())
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

// Parsing is implemented to fulfil the TryFrom trait.
impl TryFrom<&[u8]> for Command {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let mut ps: ParseState = value.into();

        let name = ps.expect_next_token()?;

        let cmd = if name.eq_ignore_ascii_case(b"addjob") {
            // <cmd> <queue> <body> <timeout> [options]
            let mut args = AddJobArgs::new(
                ps.expect_next_bytes()?,
                ps.expect_next_bytes()?,
                ps.expect_next_i64()?,
            );
            ps.expect_addjob_options(&mut args)?;
            Command::AddJob(args)
        } else if name.eq_ignore_ascii_case(b"show") {
            // <cmd> <id>
            Command::Show {
                id: ps.expect_next_bytes()?,
            }
        } else if name.eq_ignore_ascii_case(b"quit") {
            Command::Quit
        } else {
            return Err(ParsingError::UnknownCommand);
        };

        ps.expect_done_and(cmd)
    }
}
