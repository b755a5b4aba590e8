use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    pub fn not_implemented(what: impl std::fmt::Display) -> Self {
        Self::NotImplemented(what.to_string())
    }

    /// Wraps the error so it can travel through `candle_core::Result`.
    pub fn into_candle(self) -> candle_core::Error {
        candle_core::Error::wrap(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_implemented_message() {
        let err = ModelError::not_implemented("average");
        assert_eq!(err.to_string(), "not implemented: average");

        let err = err.into_candle();
        assert!(err.to_string().contains("not implemented: average"));
    }
}
