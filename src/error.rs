use thiserror::Error;

/// Errors produced while parsing or reading Switch content containers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("binary parser error: {0}")]
    BinaryParser(#[from] binrw::Error),
    #[error("bad magic for {0}")]
    BadMagic(&'static str),
    #[error("truncated header in {0}")]
    TruncatedHeader(&'static str),
    #[error("inconsistent table in {0}: {1}")]
    InconsistentTable(&'static str, String),
    #[error("unsupported encryption scheme {0}")]
    UnsupportedEncryption(u8),
    #[error("missing console key: {0}")]
    MissingKey(&'static str),
    #[error("missing master key {0:02x}")]
    MissingMasterKey(u8),
    #[error("missing title kek {0:02x}")]
    MissingTitleKek(u8),
    #[error("title key for rights ID {0} missing")]
    MissingTitleKey(String),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
