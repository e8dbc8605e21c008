use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown model `{name}` (known models: {known})")]
    UnknownModel { name: String, known: String },

    #[error("shape mismatch in {context}: {detail}")]
    ShapeMismatch { context: String, detail: String },

    #[error("cannot use {}: {source}", path.display())]
    Resource {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Gif(#[from] gif::EncodingError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn shape(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::ShapeMismatch { context: context.into(), detail: detail.into() }
    }

    pub fn resource<E>(path: impl Into<PathBuf>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Resource { path: path.into(), source: Box::new(source) }
    }
}
