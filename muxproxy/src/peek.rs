//! A stream wrapper that can peek at incoming bytes without consuming them.
//!
//! [`PeekStream`] accumulates peeked bytes in an owned read-ahead buffer
//! and transparently replays them on later reads, so protocol detection can
//! inspect the start of a connection and then hand the *whole* byte stream
//! to whichever handler claims it. At every point, the read-ahead buffer
//! followed by the unread bytes of the underlying stream equals the
//! remainder of the logical stream.

use std::{
	cmp,
	io::{Error as IoError, ErrorKind, Result as IoResult},
	pin::Pin,
	task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::Error;

/// A connection with a growable read-ahead buffer in front of it.
///
/// Reads drain the read-ahead buffer before touching the underlying stream;
/// writes and shutdown pass straight through.
#[derive(Debug)]
pub struct PeekStream<S> {
	inner: S,
	read_ahead: Vec<u8>,
}

impl<S> PeekStream<S> {
	/// Wrap a stream with an empty read-ahead buffer
	pub fn new(inner: S) -> Self {
		Self {
			inner,
			read_ahead: Vec::new(),
		}
	}

	/// The bytes peeked so far but not yet consumed by a read
	#[must_use]
	pub fn read_ahead(&self) -> &[u8] {
		&self.read_ahead
	}

	/// A reference to the wrapped stream
	#[must_use]
	pub fn get_ref(&self) -> &S {
		&self.inner
	}

	/// Discard everything peeked so far and return the raw underlying
	/// stream, positioned wherever the last peek left it.
	///
	/// This deliberately loses the buffered bytes. It exists for exactly one
	/// caller: the bare-CONNECT tunnel, which must pass all bytes *after*
	/// its request line through untouched and treats the rest of the peeked
	/// prefix as protocol chatter not meant for the tunnel.
	#[must_use]
	pub fn into_raw(mut self) -> S {
		self.read_ahead.clear();
		self.inner
	}
}

impl<S: AsyncRead + Unpin> PeekStream<S> {
	/// Ensure that up to `num` bytes of the stream prefix are buffered.
	///
	/// If the buffer already holds `num` bytes this returns immediately.
	/// Otherwise a single read of the underlying stream is issued for the
	/// missing bytes, and whatever it returns (possibly less than asked
	/// for) is appended; callers that need the full prefix re-invoke until
	/// the buffer is long enough.
	///
	/// # Errors
	/// `num == 0` is invalid. End of stream during a peek is an error, as
	/// is any I/O error from the underlying read.
	pub async fn peek(&mut self, num: usize) -> Result<(), Error> {
		if num == 0 {
			return Err(Error::InvalidPeekSize(num));
		}

		let have = self.read_ahead.len();
		if have >= num {
			return Ok(());
		}

		self.read_ahead.reserve(num - have);
		let read = (&mut self.inner)
			.take((num - have) as u64)
			.read_buf(&mut self.read_ahead)
			.await?;
		if read == 0 {
			return Err(IoError::new(
				ErrorKind::UnexpectedEof,
				"end of stream while peeking",
			)
			.into());
		}

		Ok(())
	}
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<IoResult<()>> {
		let this = self.get_mut();

		if !this.read_ahead.is_empty() {
			let len = cmp::min(buf.remaining(), this.read_ahead.len());
			buf.put_slice(&this.read_ahead[..len]);
			this.read_ahead.drain(..len);
			return Poll::Ready(Ok(()));
		}

		Pin::new(&mut this.inner).poll_read(cx, buf)
	}
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<IoResult<usize>> {
		Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
		Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[std::io::IoSlice<'_>],
	) -> Poll<IoResult<usize>> {
		Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
	}

	fn is_write_vectored(&self) -> bool {
		self.inner.is_write_vectored()
	}
}
