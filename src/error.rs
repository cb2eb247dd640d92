use std::io;

/// Crate-wide error type.
///
/// Backing-device and decoder failures are surfaced without retry; a failed
/// metadata write may leave the image in an intermediate state and is
/// reported as fatal.
#[derive(Debug)]
pub enum BdevError {
    /// Decode failures and internal invariant violations.
    Unknown(String),
    /// A feature this core refuses: compressed offsets, refcount table
    /// growth, backing files, non-512 physical sectors, shrinking.
    Unsupported(&'static str),
    /// The engine (or its cache) has been disconnected.
    Disconnected,
    /// Opaque passthrough from the backing device.
    Backing(io::Error),
}

pub type BdevResult<R> = Result<R, BdevError>;

impl BdevError {
    #[must_use]
    pub fn prepend(self, prefix: &str) -> Self {
        match self {
            BdevError::Unknown(msg) => BdevError::Unknown(format!("{}: {}", prefix, msg)),
            other => other,
        }
    }
}

impl From<io::Error> for BdevError {
    fn from(err: io::Error) -> Self {
        BdevError::Backing(err)
    }
}

macro_rules! impl_from_unknown {
    ($type:ty) => {
        impl From<$type> for BdevError {
            fn from(err: $type) -> Self {
                BdevError::Unknown(err.to_string())
            }
        }
    };
}

impl_from_unknown!(Box<bincode::ErrorKind>);
impl_from_unknown!(std::num::TryFromIntError);
impl_from_unknown!(&str);
impl_from_unknown!(String);

impl std::fmt::Display for BdevError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BdevError::Unknown(msg) => write!(f, "{}", msg),
            BdevError::Unsupported(feature) => write!(f, "unsupported: {}", feature),
            BdevError::Disconnected => write!(f, "device is disconnected"),
            BdevError::Backing(err) => write!(f, "backing device: {}", err),
        }
    }
}

impl std::error::Error for BdevError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BdevError::Backing(err) => Some(err),
            _ => None,
        }
    }
}
