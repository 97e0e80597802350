#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Launch(#[from] tritonrs_core::Error),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error("no operation registered as `{0}`")]
    UnknownOp(String),
    #[error("`{op}` argument {index}: {message}")]
    BadArgument {
        op: String,
        index: usize,
        message: String,
    },
    #[error("shape mismatch in `{op}`: {message}")]
    ShapeMismatch { op: &'static str, message: String },
    #[error("unsupported {0}")]
    Unsupported(String),
    #[error("invalid ops config: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
