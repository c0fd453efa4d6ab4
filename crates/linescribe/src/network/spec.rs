//! Network description strings.
//!
//! A compact, one-dimensional flavour of VGSL:
//!
//! | token            | meaning                                                   |
//! |------------------|-----------------------------------------------------------|
//! | `[ ... ]`        | series                                                    |
//! | `( ... )`        | parallel, outputs concatenated along depth                |
//! | `I<d>`           | input of depth `d`                                        |
//! | `C<nl><x>,<d>`   | window of `x` timesteps, then fully connected to `d`      |
//! | `Mp<x>`          | max-pool `x` timesteps                                    |
//! | `S<x>`           | stack `x` timesteps into depth                            |
//! | `Lfx<n>`         | forward LSTM with `n` states                              |
//! | `Lrx<n>`         | reversed LSTM                                             |
//! | `Lbx<n>`         | forward and reversed LSTM in parallel (`2n` outputs)      |
//! | `F<nl><d>`       | fully connected with nonlinearity `nl`                    |
//! | `O1<c\|s\|l><n>` | output: softmax + CTC, plain softmax, or logistic         |
//!
//! Nonlinearity letters: `s` logistic, `t` tanh, `r` relu, `l` linear,
//! `p` positive clip, `y` symmetric clip, `m` softmax.

use super::combinators::{Input, Parallel, Reversed, Series};
use super::convolve::{Convolve, Maxpool, Reconfig};
use super::fully_connected::FullyConnected;
use super::functions::Nonlinearity;
use super::lstm::Lstm;
use super::Network;
use crate::{LinescribeError, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Initial weights are drawn uniformly from `[-WEIGHT_RANGE, WEIGHT_RANGE]`.
pub const WEIGHT_RANGE: f32 = 0.1;

/// Parse `spec` and build a network with weights seeded from `seed`.
///
/// The first layer must be an input (`I<d>`). Depth chaining is not checked
/// here; call [`Network::validate`] on the result.
pub fn build(spec: &str, seed: u64) -> Result<Network> {
    let mut parser = Parser {
        text: spec,
        pos: 0,
        rng: StdRng::seed_from_u64(seed),
    };
    parser.skip_ws();
    if !spec.trim_start().starts_with(['[', 'I']) {
        return Err(LinescribeError::validation(format!(
            "network spec must start with a series or an input layer: '{}'",
            spec.trim()
        )));
    }
    let mut nodes = parser.parse_item(0)?;
    parser.skip_ws();
    if parser.pos < spec.len() {
        return Err(parser.unexpected(parser.pos));
    }
    let network = if nodes.len() == 1 {
        nodes.remove(0)
    } else {
        Network::Series(Series::new(nodes))
    };
    if first_leaf_is_input(&network) {
        Ok(network)
    } else {
        Err(LinescribeError::validation(format!(
            "network spec '{}' does not start with an input layer I<d>",
            spec.trim()
        )))
    }
}

fn first_leaf_is_input(network: &Network) -> bool {
    match network {
        Network::Input(_) => true,
        Network::Series(series) => series.stack().first().is_some_and(first_leaf_is_input),
        _ => false,
    }
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    rng: StdRng,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace() || c == ',') {
            self.bump();
        }
    }

    /// The whole token starting at `start`, for error messages.
    fn token_at(&self, start: usize) -> &str {
        let rest = &self.text[start..];
        let end = rest
            .find(|c: char| c.is_whitespace() || matches!(c, '[' | ']' | '(' | ')'))
            .unwrap_or(rest.len());
        &rest[..end.max(rest.chars().next().map_or(0, char::len_utf8))]
    }

    fn unexpected(&self, start: usize) -> LinescribeError {
        LinescribeError::validation(format!(
            "unknown token '{}' at offset {} in network spec",
            self.token_at(start),
            start
        ))
    }

    fn number(&mut self, start: usize) -> Result<usize> {
        let digits_start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        self.text[digits_start..self.pos]
            .parse::<usize>()
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| self.unexpected(start))
    }

    fn nonlinearity(&mut self, start: usize) -> Result<Nonlinearity> {
        self.bump()
            .and_then(Nonlinearity::from_code)
            .ok_or_else(|| self.unexpected(start))
    }

    /// One item of a series; `C` expands to two nodes.
    fn parse_item(&mut self, ni: usize) -> Result<Vec<Network>> {
        self.skip_ws();
        let start = self.pos;
        let Some(c) = self.bump() else {
            return Err(LinescribeError::validation("network spec ended unexpectedly"));
        };
        let node = match c {
            '[' => self.parse_series(ni, start)?,
            '(' => self.parse_parallel(ni, start)?,
            'I' => Network::Input(Input::new(self.number(start)?)),
            'C' => {
                let nl = self.nonlinearity(start)?;
                let window = self.number(start)?;
                if window % 2 == 0 || !self.eat(',') {
                    return Err(self.unexpected(start));
                }
                let no = self.number(start)?;
                let conv = Convolve::new(ni, window / 2);
                let fc = FullyConnected::new(ni * window, no, nl, WEIGHT_RANGE, &mut self.rng);
                return Ok(vec![Network::Convolve(conv), Network::FullyConnected(fc)]);
            }
            'M' => {
                if !self.eat('p') {
                    return Err(self.unexpected(start));
                }
                Network::Maxpool(Maxpool::new(ni, self.number(start)?))
            }
            'S' => Network::Reconfig(Reconfig::new(ni, self.number(start)?)),
            'L' => {
                let direction = self.bump();
                if !self.eat('x') {
                    return Err(self.unexpected(start));
                }
                let ns = self.number(start)?;
                match direction {
                    Some('f') => Network::Lstm(Lstm::new(ni, ns, WEIGHT_RANGE, &mut self.rng)),
                    Some('r') => Network::Reversed(Reversed::new(Network::Lstm(Lstm::new(
                        ni,
                        ns,
                        WEIGHT_RANGE,
                        &mut self.rng,
                    )))),
                    Some('b') => {
                        let fwd = Lstm::new(ni, ns, WEIGHT_RANGE, &mut self.rng);
                        let bwd = Lstm::new(ni, ns, WEIGHT_RANGE, &mut self.rng);
                        Network::Parallel(Parallel::new(vec![
                            Network::Lstm(fwd),
                            Network::Reversed(Reversed::new(Network::Lstm(bwd))),
                        ]))
                    }
                    _ => return Err(self.unexpected(start)),
                }
            }
            'F' => {
                let nl = self.nonlinearity(start)?;
                let no = self.number(start)?;
                Network::FullyConnected(FullyConnected::new(ni, no, nl, WEIGHT_RANGE, &mut self.rng))
            }
            'O' => {
                if !self.eat('1') {
                    return Err(self.unexpected(start));
                }
                let nl = match self.bump() {
                    Some('c') => Nonlinearity::Softmax,
                    Some('s') => Nonlinearity::SoftmaxNoCtc,
                    Some('l') => Nonlinearity::Logistic,
                    _ => return Err(self.unexpected(start)),
                };
                let no = self.number(start)?;
                Network::FullyConnected(FullyConnected::new(ni, no, nl, WEIGHT_RANGE, &mut self.rng))
            }
            _ => return Err(self.unexpected(start)),
        };
        Ok(vec![node])
    }

    fn parse_series(&mut self, ni: usize, start: usize) -> Result<Network> {
        let mut stack = Vec::new();
        let mut depth = ni;
        loop {
            self.skip_ws();
            match self.peek() {
                Some(']') => {
                    self.bump();
                    break;
                }
                None => {
                    return Err(LinescribeError::validation(format!(
                        "unclosed '[' at offset {start} in network spec"
                    )));
                }
                _ => {
                    for node in self.parse_item(depth)? {
                        depth = node.num_outputs();
                        stack.push(node);
                    }
                }
            }
        }
        if stack.is_empty() {
            return Err(LinescribeError::validation(format!("empty series at offset {start}")));
        }
        Ok(Network::Series(Series::new(stack)))
    }

    fn parse_parallel(&mut self, ni: usize, start: usize) -> Result<Network> {
        let mut branches = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(')') => {
                    self.bump();
                    break;
                }
                None => {
                    return Err(LinescribeError::validation(format!(
                        "unclosed '(' at offset {start} in network spec"
                    )));
                }
                _ => {
                    let mut nodes = self.parse_item(ni)?;
                    let branch = if nodes.len() == 1 {
                        nodes.remove(0)
                    } else {
                        Network::Series(Series::new(nodes))
                    };
                    branches.push(branch);
                }
            }
        }
        if branches.is_empty() {
            return Err(LinescribeError::validation(format!("empty parallel at offset {start}")));
        }
        Ok(Network::Parallel(Parallel::new(branches)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_typical_recognizer() {
        let network = build("[I36 Ct3,16 Mp3 Lfx32 Lbx48 O1c111]", 0).unwrap();
        network.validate().unwrap();
        assert_eq!(network.num_inputs(), 36);
        assert_eq!(network.num_outputs(), 111);
        assert_eq!(network.x_scale(), 3);
        assert!(network.num_weights() > 0);
    }

    #[test]
    fn test_parallel_group_concatenates_depth() {
        let network = build("[I4 (Ft3 Fr5) O1s2]", 0).unwrap();
        network.validate().unwrap();
        match &network {
            Network::Series(series) => assert_eq!(series.stack()[1].num_outputs(), 8),
            other => panic!("expected a series, got {other:?}"),
        }
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = build("[I3 Fs4]", 5).unwrap();
        let b = build("[I3 Fs4]", 5).unwrap();
        let input = super::super::NetworkIO::from_rows(&[vec![1.0, 0.5, -0.5]]);
        let scratch = super::super::NetworkScratch::sequential();
        assert_eq!(
            a.forward(&input, &scratch).float_data(),
            b.forward(&input, &scratch).float_data()
        );
    }

    #[test]
    fn test_unknown_token_is_named() {
        let err = build("[I4 Qz9 O1c3]", 0).unwrap_err();
        assert!(matches!(err, LinescribeError::Validation { .. }));
        assert!(err.to_string().contains("'Qz9'"), "{err}");
    }

    #[test]
    fn test_rejects_even_convolution_window() {
        assert!(build("[I4 Ct2,8]", 0).is_err());
    }

    #[test]
    fn test_rejects_missing_input() {
        assert!(build("[Ft4 O1c3]", 0).is_err());
        assert!(build("Lfx4", 0).is_err());
    }

    #[test]
    fn test_rejects_unclosed_series() {
        let err = build("[I4 Ft4", 0).unwrap_err();
        assert!(err.to_string().contains("unclosed"));
    }

    #[test]
    fn test_unknown_nonlinearity() {
        assert!(build("[I4 Fq4]", 0).is_err());
        assert!(build("[I4 O1x4]", 0).is_err());
    }
}
