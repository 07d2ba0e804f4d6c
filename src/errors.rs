use thiserror::Error;

#[derive(Error, Debug)]
pub enum CnError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Parse error at line {line}: {msg}")]
    Parse { line: usize, msg: String },
    #[error("Incompatible shapes: expected {expected:?}, found {found:?}")]
    IncompatibleShapes { expected: Vec<usize>, found: Vec<usize> },
    #[error("Shape error: {0}")]
    Shape(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Corpus error: {0}")]
    Corpus(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CnResult<T> = Result<T, CnError>;

impl CnError {
    pub fn shapes(expected: &[usize], found: &[usize]) -> Self {
        CnError::IncompatibleShapes {
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
}
