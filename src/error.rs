//! Error module for the simulation kernel.
use std::error::Error;
use std::fmt;

/// Error types for the library.
///
/// Every variant is raised synchronously by the call that violates its contract. A failed call
/// never leaves the kernel partially modified, so callers can recover and keep using it.
#[derive(Debug, PartialEq, Clone)]
pub enum KernelError {
    /// Error for a node ID (or node collection) that does not refer to existing nodes.
    UnknownNode(String),
    /// Error for a model name that is not registered.
    UnknownModel(String),
    /// Error for a connection request that cannot be satisfied, e.g., size mismatch, empty collection or unsatisfiable degree.
    IllegalConnection(String),
    /// Error for a delay that is not representable on the simulation grid or out of the allowed bounds.
    BadDelay(String),
    /// Error for a property that cannot be read or written, e.g., a common synapse property set on a single connection.
    BadProperty(String),
    /// Error for invalid parameters, e.g., a simulation time that is not a multiple of the resolution.
    BadParameter(String),
    /// Error for an operation that is not allowed in the current kernel state, e.g., changing the resolution after nodes were created.
    KernelState(String),
    /// Error for I/O operations.
    IOError(String),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::UnknownNode(e) => write!(f, "Unknown node: {}", e),
            KernelError::UnknownModel(e) => write!(f, "Unknown model: {}", e),
            KernelError::IllegalConnection(e) => write!(f, "Illegal connection: {}", e),
            KernelError::BadDelay(e) => write!(f, "Bad delay: {}", e),
            KernelError::BadProperty(e) => write!(f, "Bad property: {}", e),
            KernelError::BadParameter(e) => write!(f, "Bad parameter: {}", e),
            KernelError::KernelState(e) => write!(f, "Invalid kernel state: {}", e),
            KernelError::IOError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl Error for KernelError {}
