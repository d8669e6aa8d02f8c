//! HTTP proxying: absolute-form requests, CONNECT tunnels, and the
//! not-quite-HTTP bare CONNECT some legacy clients send.
//!
//! Detection looks only at the request line. A line with three fields whose
//! last field starts with `HTTP/` is a well-formed request and goes to the
//! full [`HttpProxy`], which parses requests with hyper. A line with
//! exactly two fields starting with `CONNECT` has no HTTP version at all;
//! that connection never sees an HTTP parser and is tunneled raw by
//! [`BareConnect`].

use std::{
	convert::Infallible,
	future::Future,
	io::{Error as IoError, ErrorKind},
	pin::Pin,
	sync::Arc,
	task::{Context, Poll},
	time::Duration,
};

use async_trait::async_trait;
use hyper::{
	header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, TE, TRAILER, UPGRADE, USER_AGENT},
	http::uri::Scheme,
	server::conn::Http,
	service::{service_fn, Service},
	Body, Client, Method, Request, Response, StatusCode, Uri, Version,
};
use tokio::{
	io::{AsyncRead, AsyncWrite, AsyncWriteExt},
	net::TcpStream,
	time::timeout,
};
use tracing::{debug, error};

use crate::{
	forward::forward,
	mux::{ConnHandler, Detection, Protocol, ProtocolDetector},
	peek::PeekStream,
	router::Router,
	Error,
};

/// How long an upstream connect (the transport below a proxied request) may
/// take before the request fails
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Detects HTTP-shaped request lines and dispatches them to the proxy or
/// the bare-CONNECT tunnel.
pub struct HttpDetector {
	proxy: Arc<HttpProxy>,
	router: Arc<Router>,
}

impl HttpDetector {
	/// Create a detector whose handlers dial through `router`
	#[must_use]
	pub fn new(router: Arc<Router>) -> Self {
		Self {
			proxy: Arc::new(HttpProxy::new(Arc::clone(&router))),
			router,
		}
	}
}

impl ProtocolDetector for HttpDetector {
	fn protocol(&self) -> Protocol {
		Protocol::Http
	}

	fn detect(&self, peek: &[u8]) -> Result<Detection, Error> {
		match parse_request_line(peek) {
			Some(RequestLine::Http) => Ok(Detection::Claim(Box::new(HttpProxyConn(
				Arc::clone(&self.proxy),
			)))),
			Some(RequestLine::BareConnect(target)) => {
				Ok(Detection::Claim(Box::new(BareConnect {
					router: Arc::clone(&self.router),
					target,
				})))
			}
			None => Ok(Detection::Pass),
		}
	}
}

/// What the first line of the peeked prefix turned out to be
enum RequestLine {
	/// A well-formed HTTP request line (three fields, `HTTP/` version)
	Http,
	/// `CONNECT host:port` with no version token
	BareConnect(String),
}

/// Classify the request line, if one is fully buffered yet. Fields are
/// split on single spaces; a run of spaces produces empty fields and the
/// line is then not recognized as either form.
fn parse_request_line(peek: &[u8]) -> Option<RequestLine> {
	let eol = peek.iter().position(|&b| b == b'\r' || b == b'\n')?;
	let line = String::from_utf8_lossy(&peek[..eol]);
	let fields: Vec<&str> = line.split(' ').collect();

	if fields.len() == 3 && fields[2].starts_with("HTTP/") {
		Some(RequestLine::Http)
	} else if fields.len() == 2 && fields[0] == "CONNECT" {
		Some(RequestLine::BareConnect(fields[1].to_string()))
	} else {
		None
	}
}

struct HttpProxyConn(Arc<HttpProxy>);

#[async_trait]
impl ConnHandler for HttpProxyConn {
	async fn serve(self: Box<Self>, conn: PeekStream<TcpStream>) -> Result<(), Error> {
		self.0.serve_conn(conn).await
	}
}

/// An HTTP proxy serving whole connections: CONNECT requests become raw
/// tunnels, everything else is forwarded to its absolute-form URI through a
/// shared hyper client whose connections are dialed by the [`Router`].
pub struct HttpProxy {
	router: Arc<Router>,
	client: Client<RouterConnector, Body>,
}

impl HttpProxy {
	/// Create a proxy dialing through `router`
	#[must_use]
	pub fn new(router: Arc<Router>) -> Self {
		let client = Client::builder().build::<_, Body>(RouterConnector {
			router: Arc::clone(&router),
		});
		Self { router, client }
	}

	/// Serve one connection's worth of HTTP requests. The peeked bytes are
	/// replayed to hyper's parser, so nothing from the request line is
	/// lost.
	///
	/// # Errors
	/// Returns the hyper connection error, if any.
	pub async fn serve_conn<S>(self: Arc<Self>, conn: S) -> Result<(), Error>
	where
		S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
	{
		let proxy = Arc::clone(&self);
		let service = service_fn(move |req| {
			let proxy = Arc::clone(&proxy);
			async move { Ok::<_, Infallible>(proxy.handle(req).await) }
		});

		Http::new()
			.serve_connection(conn, service)
			.with_upgrades()
			.await?;
		Ok(())
	}

	async fn handle(&self, req: Request<Body>) -> Response<Body> {
		if req.method() == Method::CONNECT {
			self.connect(req).await
		} else {
			self.proxy_request(req).await
		}
	}

	/// CONNECT: dial the authority, answer 200, then tunnel the upgraded
	/// connection. The 200 must reach the client before any tunneled bytes
	/// flow, which hyper's upgrade mechanism guarantees. The status line is
	/// written with the protocol version the client declared (`HTTP/1.0 200
	/// OK` for an HTTP/1.0 CONNECT), as a hijacking server would write it.
	async fn connect(&self, req: Request<Body>) -> Response<Body> {
		let version = req.version();

		let mut res = if let Some(target) = req.uri().authority().map(ToString::to_string) {
			debug!("http CONNECT: {target:?}");
			match self.router.dial(&target).await {
				Err(err) => text_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string()),
				Ok(backend) => {
					tokio::spawn(async move {
						match hyper::upgrade::on(req).await {
							Ok(upgraded) => {
								debug!("forwarding CONNECT to {target:?}");
								match forward(upgraded, backend).await {
									Ok(_) => debug!("done CONNECT: {target:?}"),
									Err(err) => error!("failed CONNECT to {target:?}: {err}"),
								}
							}
							Err(err) => error!("failed CONNECT to {target:?}: {err}"),
						}
					});
					Response::new(Body::empty())
				}
			}
		} else {
			text_response(StatusCode::BAD_REQUEST, "CONNECT needs host:port")
		};

		// every reply on this path mirrors the client's declared version,
		// not this server's default
		*res.version_mut() = version;
		res
	}

	/// A non-CONNECT proxy request: forward it to its absolute-form URI and
	/// stream the upstream response back as-is (redirects included).
	async fn proxy_request(&self, mut req: Request<Body>) -> Response<Body> {
		debug!("forwarding HTTP request for {:?}", req.uri().to_string());

		if req.uri().scheme().is_none() || req.uri().authority().is_none() {
			return text_response(
				StatusCode::BAD_REQUEST,
				"proxy requests must use an absolute URI",
			);
		}
		if req.uri().scheme() != Some(&Scheme::HTTP) {
			return text_response(
				StatusCode::BAD_REQUEST,
				"only http URIs can be proxied; use CONNECT for TLS",
			);
		}

		strip_hop_headers(req.headers_mut());
		if !req.headers().contains_key(USER_AGENT) {
			// explicitly empty so no default value gets injected downstream
			req.headers_mut()
				.insert(USER_AGENT, HeaderValue::from_static(""));
		}
		*req.version_mut() = Version::HTTP_11;

		match self.client.request(req).await {
			Ok(mut res) => {
				strip_hop_headers(res.headers_mut());
				res
			}
			Err(err) => {
				error!("proxy request failed: {err}");
				text_response(StatusCode::BAD_GATEWAY, &err.to_string())
			}
		}
	}
}

/// Remove hop-by-hop headers: anything named by `Connection`, plus the
/// well-known set, which must not be forwarded end-to-end
fn strip_hop_headers(headers: &mut HeaderMap) {
	let named: Vec<HeaderName> = headers
		.get_all(CONNECTION)
		.iter()
		.filter_map(|value| value.to_str().ok())
		.flat_map(|value| value.split(','))
		.filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
		.collect();
	for name in named {
		headers.remove(name);
	}

	for name in [CONNECTION, TE, TRAILER, UPGRADE] {
		headers.remove(name);
	}
	headers.remove(HeaderName::from_static("proxy-connection"));
	headers.remove(HeaderName::from_static("keep-alive"));
}

fn text_response(status: StatusCode, text: &str) -> Response<Body> {
	let mut res = Response::new(Body::from(format!("{text}\n")));
	*res.status_mut() = status;
	res
}

/// The hyper connector used for proxied requests: connections are opened by
/// [`Router::dial`], so upstream routing rules apply to plain proxy
/// requests exactly as they do to tunnels.
#[derive(Clone)]
struct RouterConnector {
	router: Arc<Router>,
}

impl Service<Uri> for RouterConnector {
	type Response = TcpStream;
	type Error = IoError;
	type Future = Pin<Box<dyn Future<Output = Result<TcpStream, IoError>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, dst: Uri) -> Self::Future {
		let router = Arc::clone(&self.router);
		Box::pin(async move {
			let host = dst
				.host()
				.ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "request URI has no host"))?
				.trim_start_matches('[')
				.trim_end_matches(']');
			let port = dst.port_u16().unwrap_or(80);
			let address = muxproxy_routemap::join_host_port(host, &port.to_string());

			timeout(UPSTREAM_CONNECT_TIMEOUT, router.dial(&address))
				.await
				.map_err(|_| IoError::new(ErrorKind::TimedOut, "upstream connect timed out"))?
		})
	}
}

/// The tunnel for `CONNECT host:port` request lines that carry no HTTP
/// version. Everything peeked so far is deliberately discarded: in
/// practice clients send only the single request line and then wait for
/// the response, so the remainder of the peeked prefix is not payload.
pub struct BareConnect {
	router: Arc<Router>,
	target: String,
}

#[async_trait]
impl ConnHandler for BareConnect {
	async fn serve(self: Box<Self>, conn: PeekStream<TcpStream>) -> Result<(), Error> {
		let mut raw = conn.into_raw();

		debug!("(bad http) CONNECT: {:?}", self.target);
		match self.router.dial(&self.target).await {
			Err(err) => {
				// the "OK" reason phrase on this 503 is long-standing
				// behavior; clients only look at the status code
				let _ = raw.write_all(b"HTTP/1.0 503 OK\r\n\r\n").await;
				Err(err.into())
			}
			Ok(backend) => {
				raw.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await?;
				forward(raw, backend).await?;
				Ok(())
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn classify(line: &[u8]) -> Option<RequestLine> {
		parse_request_line(line)
	}

	#[test]
	fn well_formed_requests_are_http() {
		assert!(matches!(
			classify(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n"),
			Some(RequestLine::Http)
		));
		assert!(matches!(
			classify(b"CONNECT example.com:443 HTTP/1.1\r\n"),
			Some(RequestLine::Http)
		));
		assert!(matches!(
			classify(b"POST http://example.com/x HTTP/1.0\n"),
			Some(RequestLine::Http)
		));
	}

	#[test]
	fn versionless_connect_is_bare() {
		match classify(b"CONNECT example.com:443\r\n") {
			Some(RequestLine::BareConnect(target)) => assert_eq!(target, "example.com:443"),
			other => panic!("expected bare connect, got {:?}", other.is_some()),
		}
	}

	#[test]
	fn incomplete_lines_pass() {
		assert!(classify(b"").is_none());
		assert!(classify(b"GET http://example.com/ HT").is_none());
		assert!(classify(b"CONNECT example.com:443").is_none());
	}

	#[test]
	fn non_http_lines_pass() {
		assert!(classify(b"\x05\x01\x00").is_none());
		assert!(classify(b"NOT A REQUEST LINE AT ALL\r\n").is_none());
		// a run of spaces yields empty fields, so this is not well-formed
		assert!(classify(b"GET  http://example.com/ HTTP/1.1\r\n").is_none());
		assert!(classify(b"CONNECT  example.com:443\r\n").is_none());
	}

	#[test]
	fn hop_headers_are_stripped() {
		let mut headers = HeaderMap::new();
		headers.insert(CONNECTION, HeaderValue::from_static("close, x-custom-hop"));
		headers.insert(
			HeaderName::from_static("x-custom-hop"),
			HeaderValue::from_static("1"),
		);
		headers.insert(
			HeaderName::from_static("proxy-connection"),
			HeaderValue::from_static("keep-alive"),
		);
		headers.insert(
			HeaderName::from_static("x-end-to-end"),
			HeaderValue::from_static("kept"),
		);

		strip_hop_headers(&mut headers);

		assert!(headers.get(CONNECTION).is_none());
		assert!(headers.get("x-custom-hop").is_none());
		assert!(headers.get("proxy-connection").is_none());
		assert_eq!(
			headers.get("x-end-to-end"),
			Some(&HeaderValue::from_static("kept"))
		);
	}
}
