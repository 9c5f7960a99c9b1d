use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An index is out of range, a byte range overruns its buffer, or a
    /// required attribute is missing.
    #[error("structural error: {0}")]
    Structural(String),
    /// Primitives that cannot be merged with each other.
    #[error("incompatible primitives: {0}")]
    Incompatible(String),
    /// A component type, element shape or draw mode the pass does not handle.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("no scene root resolves to a node")]
    NoSceneRoots,
    #[error(transparent)]
    Gltf(#[from] gltf::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Local failures a pass absorbed instead of aborting, bucketed by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureCounts {
    pub structural: usize,
    pub incompatible: usize,
    pub unsupported: usize,
}

impl FailureCounts {
    pub fn record(&mut self, error: &Error) {
        match error {
            Error::Incompatible(_) => self.incompatible += 1,
            Error::UnsupportedFormat(_) => self.unsupported += 1,
            _ => self.structural += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.structural + self.incompatible + self.unsupported
    }
}

impl fmt::Display for FailureCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} structural, {} incompatible, {} unsupported",
            self.structural, self.incompatible, self.unsupported
        )
    }
}
