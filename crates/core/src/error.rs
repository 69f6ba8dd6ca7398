use thiserror::Error;

#[derive(Error, Debug)]
pub enum MantisError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("invalid selection mask: {0}")]
    InvalidMask(String),
}
