use thiserror::Error;

/// Errors raised when a caller refers to an entity the model does not hold.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown application: {0}")]
    UnknownApplication(String),

    #[error("unknown component: {0}")]
    UnknownComponent(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("instance {0} already present")]
    DuplicateInstance(String),
}
