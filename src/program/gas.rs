//! Gas-state sequences of cyclic stages.
//!
//! A cyclic stage lists weighted gas states. Each entry is a plain code, a
//! timed profile (`time`/`substates` table evaluated as a step function), or
//! a nested list of weighted leaves. An entry may carry a template
//! `[name, start, end]`: it is then repeated for every integer in
//! `start..end`, with `name` bound in its substate expressions.
//!
//! Everything is resolved once, when the program is loaded.

use serde::{Deserialize, Serialize};

/// Upper bound on the expanded gas cycle length.
const MAX_CYCLE_LEN: usize = 1_000_000;

// ============================================================================
// Document model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasStageSpec {
    pub state: GasStateSpec,
    #[serde(default = "one")]
    pub number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GasStateSpec {
    Code(u8),
    Timed(TimedGasSpec),
    Nested(Vec<SubGasStageSpec>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubGasStageSpec {
    pub state: LeafGasSpec,
    #[serde(default = "one")]
    pub number: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LeafGasSpec {
    Code(u8),
    Timed(TimedGasSpec),
}

/// `substates[i]` holds until `time[i]`; past the last time the first substate returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedGasSpec {
    pub time: Vec<f64>,
    pub substates: Vec<SubstateSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubstateSpec {
    Code(i64),
    Expr(String),
}

/// `[variable, start, end)` integer sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec(pub String, pub i64, pub i64);

fn one() -> u32 {
    1
}

// ============================================================================
// Compiled profiles
// ============================================================================

/// Gas state over the local time of one cyclic repetition.
#[derive(Debug, Clone, PartialEq)]
pub enum GasProfile {
    Constant(u8),
    /// Step function: `values[i]` holds from `boundaries[i]` to the next boundary.
    Timed {
        boundaries: Vec<f64>,
        values: Vec<u8>,
    },
}

impl GasProfile {
    pub fn at(&self, t: f64) -> u8 {
        match self {
            GasProfile::Constant(code) => *code,
            GasProfile::Timed { boundaries, values } => {
                let idx = boundaries.partition_point(|&b| b <= t).saturating_sub(1);
                values[idx.min(values.len() - 1)]
            }
        }
    }
}

/// One period of the round-robin gas sequence.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GasCycle {
    profiles: Vec<GasProfile>,
}

impl GasCycle {
    pub fn compile(specs: &[GasStageSpec], max_time: f64) -> Result<Self, String> {
        let mut profiles = Vec::new();
        for (i, spec) in specs.iter().enumerate() {
            let bindings: Vec<Option<(&str, i64)>> = match &spec.template {
                Some(TemplateSpec(name, start, end)) => {
                    if !is_identifier(name) {
                        return Err(format!("gas_states[{i}]: invalid template variable {name:?}"));
                    }
                    if end.saturating_sub(*start) > MAX_CYCLE_LEN as i64 {
                        return Err(format!("gas_states[{i}]: template range is too large"));
                    }
                    (*start..*end).map(|v| Some((name.as_str(), v))).collect()
                }
                None => vec![None],
            };
            for binding in bindings {
                let unit = compile_entry(&spec.state, max_time, binding)
                    .map_err(|e| format!("gas_states[{i}]: {e}"))?;
                let added = unit
                    .len()
                    .checked_mul(spec.number as usize)
                    .filter(|n| profiles.len().saturating_add(*n) <= MAX_CYCLE_LEN)
                    .ok_or_else(too_long)?;
                profiles.extend(unit.iter().cycle().take(added).cloned());
            }
        }
        Ok(Self { profiles })
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Profile used by repetition `rep` (the cycle wraps around).
    pub fn for_repetition(&self, rep: u64) -> Option<&GasProfile> {
        if self.profiles.is_empty() {
            return None;
        }
        self.profiles.get((rep % self.profiles.len() as u64) as usize)
    }
}

/// Profiles of one repetition of a gas-state entry.
fn compile_entry(
    state: &GasStateSpec,
    max_time: f64,
    binding: Option<(&str, i64)>,
) -> Result<Vec<GasProfile>, String> {
    match state {
        GasStateSpec::Code(code) => Ok(vec![GasProfile::Constant(*code)]),
        GasStateSpec::Timed(timed) => Ok(vec![compile_timed(timed, max_time, binding)?]),
        GasStateSpec::Nested(subs) => {
            let mut entry = Vec::new();
            for sub in subs {
                let leaf = match &sub.state {
                    LeafGasSpec::Code(code) => GasProfile::Constant(*code),
                    LeafGasSpec::Timed(timed) => compile_timed(timed, max_time, binding)?,
                };
                let count = sub.number as usize;
                if entry.len().saturating_add(count) > MAX_CYCLE_LEN {
                    return Err(too_long());
                }
                entry.extend(std::iter::repeat(leaf).take(count));
            }
            Ok(entry)
        }
    }
}

fn too_long() -> String {
    format!("gas states expand to more than {MAX_CYCLE_LEN} entries")
}

fn compile_timed(
    spec: &TimedGasSpec,
    max_time: f64,
    binding: Option<(&str, i64)>,
) -> Result<GasProfile, String> {
    if spec.time.is_empty() || spec.time.len() != spec.substates.len() {
        return Err(format!(
            "timed gas state needs matching non-empty `time` ({}) and `substates` ({})",
            spec.time.len(),
            spec.substates.len()
        ));
    }
    if spec.time.iter().any(|t| !t.is_finite() || *t < 0.0 || *t > max_time) {
        return Err(format!("substate times must lie within [0, {max_time}]"));
    }
    if spec.time.windows(2).any(|w| w[1] <= w[0]) {
        return Err("substate times must be strictly increasing".into());
    }

    let mut values = spec
        .substates
        .iter()
        .map(|s| {
            let value = match s {
                SubstateSpec::Code(code) => *code,
                SubstateSpec::Expr(text) => Expr::parse(text)?.eval(binding)?,
            };
            u8::try_from(value).map_err(|_| format!("gas state {value} is outside 0..=255"))
        })
        .collect::<Result<Vec<u8>, String>>()?;
    let first = values[0];
    values.extend([first, first]);

    let mut boundaries = Vec::with_capacity(spec.time.len() + 2);
    boundaries.push(0.0);
    boundaries.extend_from_slice(&spec.time);
    boundaries.push(max_time);
    Ok(GasProfile::Timed { boundaries, values })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ============================================================================
// Substate expressions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Integer expression over one template variable.
///
/// Grammar: `cmp := sum (("=="|"!="|"<"|"<="|">"|">=") sum)?`,
/// `sum := product (("+"|"-") product)*`, `product := unary ("*" unary)*`,
/// `unary := "-" unary | INT | IDENT | "(" cmp ")"`. Comparisons yield 0 or 1.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Var(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Ident(String),
    Op(BinOp),
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();
        match c {
            b' ' | b'\t' => i += 1,
            b'0'..=b'9' => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let value = src[start..i]
                    .parse()
                    .map_err(|_| format!("integer {} is too large", &src[start..i]))?;
                tokens.push(Token::Int(value));
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(Token::Ident(src[start..i].to_string()));
            }
            b'(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            b')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            b'+' | b'-' | b'*' => {
                tokens.push(Token::Op(match c {
                    b'+' => BinOp::Add,
                    b'-' => BinOp::Sub,
                    _ => BinOp::Mul,
                }));
                i += 1;
            }
            b'=' | b'!' | b'<' | b'>' => {
                let (op, width) = match (c, next) {
                    (b'=', Some(b'=')) => (BinOp::Eq, 2),
                    (b'!', Some(b'=')) => (BinOp::Ne, 2),
                    (b'<', Some(b'=')) => (BinOp::Le, 2),
                    (b'>', Some(b'=')) => (BinOp::Ge, 2),
                    (b'<', _) => (BinOp::Lt, 1),
                    (b'>', _) => (BinOp::Gt, 1),
                    _ => return Err(format!("unexpected {:?} at offset {i}", c as char)),
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            _ => {
                return Err(format!(
                    "unexpected character {:?} at offset {i}",
                    src[i..].chars().next().unwrap_or('?')
                ))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_op(&self, accept: &[BinOp]) -> Option<BinOp> {
        match self.peek() {
            Some(Token::Op(op)) if accept.contains(op) => Some(*op),
            _ => None,
        }
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let lhs = self.sum()?;
        const CMP: [BinOp; 6] = [BinOp::Eq, BinOp::Ne, BinOp::Lt, BinOp::Le, BinOp::Gt, BinOp::Ge];
        if let Some(op) = self.peek_op(&CMP) {
            self.pos += 1;
            let rhs = self.sum()?;
            return Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn sum(&mut self) -> Result<Expr, String> {
        let mut lhs = self.product()?;
        while let Some(op) = self.peek_op(&[BinOp::Add, BinOp::Sub]) {
            self.pos += 1;
            let rhs = self.product()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn product(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        while self.peek_op(&[BinOp::Mul]).is_some() {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(BinOp::Mul, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Op(BinOp::Sub)) => Ok(Expr::Neg(Box::new(self.unary()?))),
            Some(Token::Int(v)) => Ok(Expr::Int(v)),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let inner = self.comparison()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("missing `)`".into()),
                }
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".into()),
        }
    }
}

impl Expr {
    pub fn parse(src: &str) -> Result<Self, String> {
        let mut parser = Parser {
            tokens: tokenize(src)?,
            pos: 0,
        };
        let expr = parser
            .comparison()
            .map_err(|e| format!("expression {src:?}: {e}"))?;
        if parser.pos != parser.tokens.len() {
            return Err(format!("expression {src:?}: trailing input"));
        }
        Ok(expr)
    }

    pub fn eval(&self, binding: Option<(&str, i64)>) -> Result<i64, String> {
        match self {
            Expr::Int(v) => Ok(*v),
            Expr::Var(name) => match binding {
                Some((bound, value)) if bound == name => Ok(value),
                _ => Err(format!("unknown variable `{name}`")),
            },
            Expr::Neg(inner) => inner
                .eval(binding)?
                .checked_neg()
                .ok_or_else(|| "integer overflow".to_string()),
            Expr::Binary(op, lhs, rhs) => {
                let (a, b) = (lhs.eval(binding)?, rhs.eval(binding)?);
                let value = match op {
                    BinOp::Add => a.checked_add(b),
                    BinOp::Sub => a.checked_sub(b),
                    BinOp::Mul => a.checked_mul(b),
                    BinOp::Eq => Some(i64::from(a == b)),
                    BinOp::Ne => Some(i64::from(a != b)),
                    BinOp::Lt => Some(i64::from(a < b)),
                    BinOp::Le => Some(i64::from(a <= b)),
                    BinOp::Gt => Some(i64::from(a > b)),
                    BinOp::Ge => Some(i64::from(a >= b)),
                };
                value.ok_or_else(|| "integer overflow".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str, binding: Option<(&str, i64)>) -> Result<i64, String> {
        Expr::parse(src)?.eval(binding)
    }

    #[test]
    fn expression_precedence_and_comparisons() {
        assert_eq!(eval("1 + 2 * 3", None), Ok(7));
        assert_eq!(eval("(1 + 2) * 3", None), Ok(9));
        assert_eq!(eval("-n + 10", Some(("n", 4))), Ok(6));
        assert_eq!(eval("n * 2 == 8", Some(("n", 4))), Ok(1));
        assert_eq!(eval("n >= 5", Some(("n", 4))), Ok(0));
        assert_eq!(eval("n != 5", Some(("n", 4))), Ok(1));
    }

    #[test]
    fn expression_errors() {
        assert!(eval("1 +", None).is_err());
        assert!(eval("(1", None).is_err());
        assert!(eval("2 2", None).is_err());
        assert!(eval("x", None).is_err());
        assert!(eval("y + 1", Some(("x", 1))).is_err());
        assert!(eval("1 / 2", None).is_err());
        assert!(eval("__import__", None).is_err());
    }

    #[test]
    fn timed_profile_wraps_to_first_substate() {
        let spec = TimedGasSpec {
            time: vec![2.0, 5.0],
            substates: vec![SubstateSpec::Code(3), SubstateSpec::Code(7)],
        };
        let profile = compile_timed(&spec, 10.0, None).unwrap();
        assert_eq!(profile.at(0.0), 3);
        assert_eq!(profile.at(1.9), 3);
        assert_eq!(profile.at(2.0), 7);
        assert_eq!(profile.at(4.9), 7);
        assert_eq!(profile.at(5.0), 3);
        assert_eq!(profile.at(9.9), 3);
    }

    #[test]
    fn template_expands_every_value() {
        let specs: Vec<GasStageSpec> = serde_yaml::from_str(
            "- state: {time: [5, 10], substates: [0, 'k * 10']}\n  \
             number: 1\n  \
             template: [k, 1, 4]\n\
             - state: 9\n  \
             number: 2\n",
        )
        .unwrap();
        let cycle = GasCycle::compile(&specs, 10.0).unwrap();
        assert_eq!(cycle.len(), 5);
        let at_six: Vec<u8> = (0..5)
            .map(|rep| cycle.for_repetition(rep).unwrap().at(6.0))
            .collect();
        assert_eq!(at_six, vec![10, 20, 30, 9, 9]);
        assert_eq!(cycle.for_repetition(5).unwrap().at(6.0), 10);
    }

    #[test]
    fn nested_states_are_weighted() {
        let specs: Vec<GasStageSpec> = serde_yaml::from_str(
            "- state: [{state: 1, number: 2}, {state: 2, number: 1}]\n  number: 2\n",
        )
        .unwrap();
        let cycle = GasCycle::compile(&specs, 1.0).unwrap();
        let codes: Vec<u8> = (0..cycle.len() as u64)
            .map(|rep| cycle.for_repetition(rep).unwrap().at(0.0))
            .collect();
        assert_eq!(codes, vec![1, 1, 2, 1, 1, 2]);
    }

    #[test]
    fn out_of_range_gas_code_is_rejected() {
        let spec = TimedGasSpec {
            time: vec![0.0],
            substates: vec![SubstateSpec::Expr("n * 100".into())],
        };
        assert!(compile_timed(&spec, 1.0, Some(("n", 3))).is_err());
        assert!(compile_timed(&spec, 1.0, Some(("n", 2))).is_ok());
    }

    #[test]
    fn oversized_weights_are_rejected_before_expansion() {
        for text in [
            "- state: 1\n  number: 4294967295\n",
            "- state: [{state: 1, number: 4294967295}]\n",
            "- state: [{state: 1, number: 1000}]\n  number: 1001\n",
        ] {
            let specs: Vec<GasStageSpec> = serde_yaml::from_str(text).unwrap();
            let err = GasCycle::compile(&specs, 1.0).unwrap_err();
            assert!(err.contains("expand to more than"), "{text}: {err}");
        }

        let empty_nested: Vec<GasStageSpec> =
            serde_yaml::from_str("- state: []\n  number: 4294967295\n").unwrap();
        assert!(GasCycle::compile(&empty_nested, 1.0).unwrap().is_empty());
    }
}
