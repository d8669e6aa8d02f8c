//! Bidirectional byte forwarding between a client and an upstream.

use std::io::Result as IoResult;

use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Copy bytes in both directions between `client` and `upstream` until both
/// directions have finished.
///
/// The two directions run concurrently and independently. When one
/// direction's copy ends (clean end of stream or error), the write half of
/// its destination is shut down, so a peer that is done sending can still
/// receive the other direction's trailing bytes. Both directions always run
/// to completion before this returns; the first error (client-to-upstream
/// checked first) is surfaced.
///
/// Returns the number of bytes copied client-to-upstream and
/// upstream-to-client.
///
/// # Errors
/// Returns the first read or write error of either direction.
pub async fn forward<C, U>(client: C, upstream: U) -> IoResult<(u64, u64)>
where
	C: AsyncRead + AsyncWrite,
	U: AsyncRead + AsyncWrite,
{
	let (mut client_rd, mut client_wr) = split(client);
	let (mut upstream_rd, mut upstream_wr) = split(upstream);

	let client_to_upstream = async {
		let res = tokio::io::copy(&mut client_rd, &mut upstream_wr).await;
		trace!(?res, "client -> upstream finished");
		// propagate our end-of-stream (or failure) as a half-close
		let _ = upstream_wr.shutdown().await;
		res
	};

	let upstream_to_client = async {
		let res = tokio::io::copy(&mut upstream_rd, &mut client_wr).await;
		trace!(?res, "upstream -> client finished");
		let _ = client_wr.shutdown().await;
		res
	};

	let (sent, received) = tokio::join!(client_to_upstream, upstream_to_client);
	Ok((sent?, received?))
}
