//! Bidirectional byte shuttling between two async duplex streams, used by the WebSocket and raw
//! TCP connectors to splice a client connection to its chosen backend.

use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional as tokio_copy_bidirectional};

#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
	pub sent: u64,
	pub received: u64,
}

/// Copies bytes between `a` and `b` in both directions until either side reaches EOF or errors.
/// Half-close is respected: once one side is done reading, its writer is shut down and the other
/// direction keeps flowing until it too completes.
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> std::io::Result<Stats>
where
	A: AsyncRead + AsyncWrite + Unpin + ?Sized,
	B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
	let (sent, received) = tokio_copy_bidirectional(a, b).await?;
	Ok(Stats { sent, received })
}
