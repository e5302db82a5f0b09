/// Unified failure taxonomy for container drivers.
///
/// Drivers never retry; they map SDK and transport failures into these
/// variants so the layers above need not know back-end specific error types.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
	/// Socket, connection, or I/O level failure.
	#[error("transport failure: {0}")]
	Transport(String),

	/// The addressed object does not exist.
	#[error("object not found")]
	NotFound,

	/// A checksum or size check failed.
	#[error("integrity check failed: {0}")]
	Integrity(String),

	/// The back-end cannot perform this operation.
	#[error("operation not supported by this back-end")]
	Unsupported,

	/// Any other back-end error, with its native code and message.
	#[error("back-end error [{code}]: {message}")]
	Backend { code: String, message: String },
}

impl ContainerError {
	pub fn backend(code: impl Into<String>, message: impl Into<String>) -> Self {
		Self::Backend {
			code: code.into(),
			message: message.into(),
		}
	}

	pub fn integrity(reason: impl Into<String>) -> Self {
		Self::Integrity(reason.into())
	}
}

impl From<std::io::Error> for ContainerError {
	fn from(err: std::io::Error) -> Self {
		if err.kind() == std::io::ErrorKind::NotFound {
			Self::NotFound
		} else {
			Self::Transport(err.to_string())
		}
	}
}

pub type ContainerResult<T> = std::result::Result<T, ContainerError>;
