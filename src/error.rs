use std::path::PathBuf;

pub type GlintResult<T> = Result<T, GlintError>;

#[derive(thiserror::Error, Debug)]
pub enum GlintError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("load error for '{path}': {message}")]
    Load { path: PathBuf, message: String },

    #[error("shader compilation error: {0}")]
    Compilation(String),

    #[error("expression error: {0}")]
    Expression(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GlintError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn load(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Load {
            path: path.into(),
            message: msg.into(),
        }
    }

    pub fn compilation(msg: impl Into<String>) -> Self {
        Self::Compilation(msg.into())
    }

    pub fn expression(msg: impl Into<String>) -> Self {
        Self::Expression(msg.into())
    }
}
