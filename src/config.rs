//! Parser for the nested key/value network and solver description format:
//!
//! ```text
//! name: "demo"
//! layer {
//!   name: "conv1"
//!   type: CONVOLUTION
//!   convolution_param { num_output: 16 kernel_size: 5 stride: 1 }
//! }
//! ```
//!
//! Scalars are `key: value`; blocks are `key { ... }`. `#` starts a
//! comment. The typed configs below carry serde derives so a parsed
//! description can be dumped as JSON for diagnostics.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{CnError, CnResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Train,
    Test,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Train => write!(f, "TRAIN"),
            Phase::Test => write!(f, "TEST"),
        }
    }
}

// ---------------------------------------------------------------------------
// Untyped tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Entry {
    Scalar(String, String),
    Block(String, Block),
}

#[derive(Debug, Clone, Default)]
struct Block {
    entries: Vec<Entry>,
}

impl Block {
    fn scalar(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|e| match e {
            Entry::Scalar(k, v) if k == key => Some(v.as_str()),
            _ => None,
        })
    }

    fn block(&self, key: &str) -> Option<&Block> {
        self.entries.iter().find_map(|e| match e {
            Entry::Block(k, b) if k == key => Some(b),
            _ => None,
        })
    }

    fn blocks<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Block> {
        self.entries.iter().filter_map(move |e| match e {
            Entry::Block(k, b) if k == key => Some(b),
            _ => None,
        })
    }

    fn parse<T: FromStr>(&self, key: &str, ctx: &str) -> CnResult<Option<T>> {
        match self.scalar(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                CnError::Config(format!("{ctx}: cannot parse `{key}: {raw}`"))
            }),
        }
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T, ctx: &str) -> CnResult<T> {
        Ok(self.parse(key, ctx)?.unwrap_or(default))
    }

    fn require<T: FromStr>(&self, key: &str, ctx: &str) -> CnResult<T> {
        self.parse(key, ctx)?
            .ok_or_else(|| CnError::Config(format!("{ctx}: missing `{key}`")))
    }
}

// ---------------------------------------------------------------------------
// Tokenizer + parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Colon,
    LBrace,
    RBrace,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
            line: 1,
        }
    }

    fn error(&self, msg: impl Into<String>) -> CnError {
        CnError::Parse {
            line: self.line,
            msg: msg.into(),
        }
    }

    fn next_token(&mut self) -> CnResult<Option<Token>> {
        loop {
            match self.chars.peek() {
                None => return Ok(None),
                Some('\n') => {
                    self.line += 1;
                    self.chars.next();
                }
                Some(c) if c.is_whitespace() => {
                    self.chars.next();
                }
                Some('#') => {
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.chars.next();
                    }
                }
                Some(':') => {
                    self.chars.next();
                    return Ok(Some(Token::Colon));
                }
                Some('{') => {
                    self.chars.next();
                    return Ok(Some(Token::LBrace));
                }
                Some('}') => {
                    self.chars.next();
                    return Ok(Some(Token::RBrace));
                }
                Some('"') => {
                    self.chars.next();
                    let mut s = String::new();
                    loop {
                        match self.chars.next() {
                            Some('"') => return Ok(Some(Token::Quoted(s))),
                            Some('\n') | None => {
                                return Err(self.error("unterminated string literal"))
                            }
                            Some(c) => s.push(c),
                        }
                    }
                }
                Some(_) => {
                    let mut s = String::new();
                    while let Some(&c) = self.chars.peek() {
                        if c.is_whitespace() || matches!(c, ':' | '{' | '}' | '#' | '"') {
                            break;
                        }
                        s.push(c);
                        self.chars.next();
                    }
                    return Ok(Some(Token::Word(s)));
                }
            }
        }
    }
}

fn parse_text(text: &str) -> CnResult<Block> {
    let mut lexer = Lexer::new(text);
    let root = parse_block(&mut lexer, true)?;
    Ok(root)
}

fn parse_block(lexer: &mut Lexer<'_>, top_level: bool) -> CnResult<Block> {
    let mut block = Block::default();
    loop {
        let token = match lexer.next_token()? {
            None if top_level => return Ok(block),
            None => return Err(lexer.error("unexpected end of input inside a block")),
            Some(Token::RBrace) if !top_level => return Ok(block),
            Some(t) => t,
        };
        let key = match token {
            Token::Word(w) => w,
            other => return Err(lexer.error(format!("expected a key, found {other:?}"))),
        };
        match lexer.next_token()? {
            Some(Token::Colon) => {
                // `key: { ... }` is tolerated as a block too.
                match lexer.next_token()? {
                    Some(Token::Word(v)) => block.entries.push(Entry::Scalar(key, v)),
                    Some(Token::Quoted(v)) => block.entries.push(Entry::Scalar(key, v)),
                    Some(Token::LBrace) => {
                        let inner = parse_block(lexer, false)?;
                        block.entries.push(Entry::Block(key, inner));
                    }
                    _ => return Err(lexer.error(format!("missing value for `{key}`"))),
                }
            }
            Some(Token::LBrace) => {
                let inner = parse_block(lexer, false)?;
                block.entries.push(Entry::Block(key, inner));
            }
            other => {
                return Err(lexer.error(format!(
                    "expected `:` or `{{` after `{key}`, found {other:?}"
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Typed network config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerType {
    Data,
    Convolution,
    InnerProduct,
    Pooling,
    ReLU,
    Lrn,
    Dropout,
    SoftmaxLoss,
}

impl FromStr for LayerType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "DATA" => Ok(LayerType::Data),
            "CONVOLUTION" => Ok(LayerType::Convolution),
            "INNER_PRODUCT" => Ok(LayerType::InnerProduct),
            "POOLING" => Ok(LayerType::Pooling),
            "RELU" => Ok(LayerType::ReLU),
            "LRN" => Ok(LayerType::Lrn),
            "DROPOUT" => Ok(LayerType::Dropout),
            "SOFTMAX_LOSS" => Ok(LayerType::SoftmaxLoss),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FillerKind {
    Xavier,
    Gaussian,
    Constant,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FillerConfig {
    pub kind: FillerKind,
    pub mean: f32,
    pub std: f32,
    pub value: f32,
}

impl FillerConfig {
    pub fn xavier() -> Self {
        Self {
            kind: FillerKind::Xavier,
            mean: 0.0,
            std: 0.01,
            value: 0.0,
        }
    }

    pub fn constant(value: f32) -> Self {
        Self {
            kind: FillerKind::Constant,
            mean: 0.0,
            std: 0.01,
            value,
        }
    }

    fn from_block(block: Option<&Block>, default: Self, ctx: &str) -> CnResult<Self> {
        let Some(block) = block else {
            return Ok(default);
        };
        let kind = match block.scalar("type") {
            None | Some("xavier") => FillerKind::Xavier,
            Some("gaussian") => FillerKind::Gaussian,
            Some("constant") => FillerKind::Constant,
            Some(other) => {
                return Err(CnError::Config(format!("{ctx}: unknown filler `{other}`")))
            }
        };
        Ok(Self {
            kind,
            mean: block.parse_or("mean", 0.0, ctx)?,
            std: block.parse_or("std", 0.01, ctx)?,
            value: block.parse_or("value", 0.0, ctx)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvolutionParam {
    pub num_output: usize,
    pub kernel_size: usize,
    pub pad: usize,
    pub stride: usize,
    pub group: usize,
    pub weight_filler: FillerConfig,
    pub bias_filler: FillerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerProductParam {
    pub num_output: usize,
    pub weight_filler: FillerConfig,
    pub bias_filler: FillerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolingParam {
    pub kernel_size: usize,
    pub stride: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LrnParam {
    pub local_size: usize,
    pub alpha: f32,
    pub beta: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropoutParam {
    pub dropout_ratio: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataParam {
    pub batch_size: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    pub layer_type: LayerType,
    pub include_phase: Option<Phase>,
    pub convolution: Option<ConvolutionParam>,
    pub inner_product: Option<InnerProductParam>,
    pub pooling: Option<PoolingParam>,
    pub lrn: Option<LrnParam>,
    pub dropout: Option<DropoutParam>,
    pub data: Option<DataParam>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    pub name: String,
    pub layers: Vec<LayerConfig>,
}

fn parse_phase(raw: &str, ctx: &str) -> CnResult<Phase> {
    match raw {
        "TRAIN" | "0" => Ok(Phase::Train),
        "TEST" | "1" => Ok(Phase::Test),
        other => Err(CnError::Config(format!("{ctx}: unknown phase `{other}`"))),
    }
}

impl NetConfig {
    pub fn from_str(text: &str) -> CnResult<Self> {
        let root = parse_text(text)?;
        let name = root.scalar("name").unwrap_or("net").to_string();
        let mut layers = Vec::new();
        for layer in root.blocks("layer").chain(root.blocks("layers")) {
            layers.push(Self::parse_layer(layer)?);
        }
        if layers.is_empty() {
            return Err(CnError::Config("network has no layers".into()));
        }
        Ok(Self { name, layers })
    }

    pub fn from_file(path: impl AsRef<Path>) -> CnResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CnError::Config(format!("cannot read network config {}: {e}", path.display()))
        })?;
        Self::from_str(&text)
    }

    fn parse_layer(block: &Block) -> CnResult<LayerConfig> {
        let name = block.scalar("name").unwrap_or("unnamed").to_string();
        let ctx = format!("layer `{name}`");
        let raw_type = block
            .scalar("type")
            .ok_or_else(|| CnError::Config(format!("{ctx}: missing `type`")))?;
        let layer_type = raw_type
            .parse::<LayerType>()
            .map_err(|_| CnError::Config(format!("{ctx}: unsupported layer type `{raw_type}`")))?;
        let include_phase = match block.block("include").and_then(|b| b.scalar("phase")) {
            Some(raw) => Some(parse_phase(raw, &ctx)?),
            None => None,
        };

        let mut cfg = LayerConfig {
            name,
            layer_type,
            include_phase,
            convolution: None,
            inner_product: None,
            pooling: None,
            lrn: None,
            dropout: None,
            data: None,
        };

        match layer_type {
            LayerType::Convolution => {
                let p = block
                    .block("convolution_param")
                    .ok_or_else(|| CnError::Config(format!("{ctx}: missing convolution_param")))?;
                cfg.convolution = Some(ConvolutionParam {
                    num_output: p.require("num_output", &ctx)?,
                    kernel_size: p.require("kernel_size", &ctx)?,
                    pad: p.parse_or("pad", 0, &ctx)?,
                    stride: p.parse_or("stride", 1, &ctx)?,
                    group: p.parse_or("group", 1, &ctx)?,
                    weight_filler: FillerConfig::from_block(
                        p.block("weight_filler"),
                        FillerConfig::xavier(),
                        &ctx,
                    )?,
                    bias_filler: FillerConfig::from_block(
                        p.block("bias_filler"),
                        FillerConfig::constant(0.0),
                        &ctx,
                    )?,
                });
            }
            LayerType::InnerProduct => {
                let p = block
                    .block("inner_product_param")
                    .ok_or_else(|| CnError::Config(format!("{ctx}: missing inner_product_param")))?;
                cfg.inner_product = Some(InnerProductParam {
                    num_output: p.require("num_output", &ctx)?,
                    weight_filler: FillerConfig::from_block(
                        p.block("weight_filler"),
                        FillerConfig::xavier(),
                        &ctx,
                    )?,
                    bias_filler: FillerConfig::from_block(
                        p.block("bias_filler"),
                        FillerConfig::constant(0.0),
                        &ctx,
                    )?,
                });
            }
            LayerType::Pooling => {
                let p = block
                    .block("pooling_param")
                    .ok_or_else(|| CnError::Config(format!("{ctx}: missing pooling_param")))?;
                cfg.pooling = Some(PoolingParam {
                    kernel_size: p.require("kernel_size", &ctx)?,
                    stride: p.parse_or("stride", 1, &ctx)?,
                });
            }
            LayerType::Lrn => {
                let p = block.block("lrn_param");
                cfg.lrn = Some(LrnParam {
                    local_size: p.map_or(Ok(5), |b| b.parse_or("local_size", 5, &ctx))?,
                    alpha: p.map_or(Ok(1e-4), |b| b.parse_or("alpha", 1e-4, &ctx))?,
                    beta: p.map_or(Ok(0.75), |b| b.parse_or("beta", 0.75, &ctx))?,
                });
            }
            LayerType::Dropout => {
                let p = block.block("dropout_param");
                cfg.dropout = Some(DropoutParam {
                    dropout_ratio: p.map_or(Ok(0.5), |b| b.parse_or("dropout_ratio", 0.5, &ctx))?,
                });
            }
            LayerType::Data => {
                let p = block
                    .block("data_param")
                    .ok_or_else(|| CnError::Config(format!("{ctx}: missing data_param")))?;
                cfg.data = Some(DataParam {
                    batch_size: p.require("batch_size", &ctx)?,
                    channels: p.require("channels", &ctx)?,
                    height: p.require("height", &ctx)?,
                    width: p.require("width", &ctx)?,
                });
            }
            LayerType::ReLU | LayerType::SoftmaxLoss => {}
        }
        Ok(cfg)
    }
}

// ---------------------------------------------------------------------------
// Typed solver config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LrPolicy {
    Fixed,
    Step { stepsize: usize, gamma: f32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    pub net: String,
    pub base_lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub lr_policy: LrPolicy,
    pub max_iter: usize,
}

impl SolverConfig {
    pub fn from_str(text: &str) -> CnResult<Self> {
        let root = parse_text(text)?;
        let ctx = "solver";
        let lr_policy = match root.scalar("lr_policy").unwrap_or("fixed") {
            "fixed" => LrPolicy::Fixed,
            "step" => LrPolicy::Step {
                stepsize: root.require("stepsize", ctx)?,
                gamma: root.parse_or("gamma", 0.1, ctx)?,
            },
            other => {
                return Err(CnError::Config(format!(
                    "{ctx}: unsupported lr_policy `{other}`"
                )))
            }
        };
        Ok(Self {
            net: root
                .scalar("net")
                .ok_or_else(|| CnError::Config(format!("{ctx}: missing `net`")))?
                .to_string(),
            base_lr: root.require("base_lr", ctx)?,
            momentum: root.parse_or("momentum", 0.0, ctx)?,
            weight_decay: root.parse_or("weight_decay", 0.0, ctx)?,
            lr_policy,
            max_iter: root.parse_or("max_iter", 1, ctx)?,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> CnResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CnError::Config(format!("cannot read solver config {}: {e}", path.display()))
        })?;
        Self::from_str(&text)
    }

    /// Effective learning rate at a global iteration.
    pub fn learning_rate(&self, iter: usize) -> f32 {
        match self.lr_policy {
            LrPolicy::Fixed => self.base_lr,
            LrPolicy::Step { stepsize, gamma } => {
                self.base_lr * gamma.powi((iter / stepsize.max(1)) as i32)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_layers() {
        let net = NetConfig::from_str(
            r#"
            name: "demo"
            # a comment
            layer {
              name: "data"
              type: DATA
              include { phase: TRAIN }
              data_param { batch_size: 8 channels: 1 height: 4 width: 4 }
            }
            layer {
              name: "conv1"
              type: CONVOLUTION
              convolution_param {
                num_output: 6
                kernel_size: 3
                group: 2
                weight_filler { type: "gaussian" std: 0.05 }
              }
            }
            "#,
        )
        .unwrap();
        assert_eq!(net.name, "demo");
        assert_eq!(net.layers.len(), 2);
        assert_eq!(net.layers[0].include_phase, Some(Phase::Train));
        let conv = net.layers[1].convolution.as_ref().unwrap();
        assert_eq!(conv.num_output, 6);
        assert_eq!(conv.group, 2);
        assert_eq!(conv.stride, 1);
        assert_eq!(conv.weight_filler.kind, FillerKind::Gaussian);
        assert!((conv.weight_filler.std - 0.05).abs() < 1e-6);
    }

    #[test]
    fn rejects_unknown_layer_type() {
        let err = NetConfig::from_str(r#"layer { name: "x" type: TANH }"#).unwrap_err();
        assert!(err.to_string().contains("unsupported layer type"));
    }

    #[test]
    fn solver_step_policy() {
        let solver = SolverConfig::from_str(
            r#"
            net: "net.conf"
            base_lr: 0.1
            lr_policy: "step"
            stepsize: 10
            gamma: 0.5
            momentum: 0.9
            max_iter: 3
            "#,
        )
        .unwrap();
        assert_eq!(solver.learning_rate(0), 0.1);
        assert_eq!(solver.learning_rate(9), 0.1);
        assert!((solver.learning_rate(10) - 0.05).abs() < 1e-7);
        assert!((solver.learning_rate(25) - 0.025).abs() < 1e-7);
    }

    #[test]
    fn configs_round_trip_through_json() {
        let solver = SolverConfig::from_str("net: \"n\" base_lr: 0.01").unwrap();
        let json = serde_json::to_string(&solver).unwrap();
        let back: SolverConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.base_lr, solver.base_lr);
        assert_eq!(back.lr_policy, LrPolicy::Fixed);
    }
}
