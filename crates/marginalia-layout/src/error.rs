use thiserror::Error;

/// Errors raised while computing a layout.
///
/// `Degenerate` never leaves the projector: it selects the circle
/// fallback instead. `Cancelled` is the only error a caller can see.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("degenerate projection: {0}")]
    Degenerate(String),
    #[error("layout cancelled")]
    Cancelled,
}
