//! Utilities for end-to-end tests of the muxproxy server

use std::{net::SocketAddr, sync::Arc};

use hyper::{
	header::{HeaderValue, USER_AGENT},
	service::{make_service_fn, service_fn},
	Body, Request, Response, Server as HyperServer, StatusCode,
};
use muxproxy::{router::Router, server::Server};
use muxproxy_routemap::RouteSet;
use tokio::net::TcpListener;

/// Start a muxproxy server with the given route file contents on an
/// ephemeral localhost port, and return the bound address.
#[allow(dead_code)] // False positive, this function is used in tests, just not *all* of them
pub async fn start_proxy(routes: &str) -> SocketAddr {
	let router = Arc::new(Router::new(RouteSet::parse(routes).unwrap()));
	let server = Server::bind(&["127.0.0.1:0".to_string()], router).unwrap();
	let addr = server.local_addrs()[0];
	tokio::spawn(server.run());
	addr
}

/// Start a TCP server that echoes everything it receives back to the
/// sender, connection by connection.
#[allow(dead_code)]
pub async fn start_echo() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();

	tokio::spawn(async move {
		loop {
			let Ok((mut conn, _)) = listener.accept().await else {
				return;
			};
			tokio::spawn(async move {
				let (mut rd, mut wr) = conn.split();
				let _ = tokio::io::copy(&mut rd, &mut wr).await;
			});
		}
	});

	addr
}

/// Start an HTTP origin server for proxying tests. It answers `/hello`
/// with a fixed body, `/redirect` with a 302, and reflects the request's
/// `User-Agent` in an `echo-user-agent` response header (`[absent]` when
/// the request carried none).
#[allow(dead_code)]
pub async fn start_http_upstream() -> SocketAddr {
	let make_service = make_service_fn(|_conn| async {
		Ok::<_, hyper::Error>(service_fn(|req: Request<Body>| async move {
			let user_agent = req
				.headers()
				.get(USER_AGENT)
				.cloned()
				.unwrap_or_else(|| HeaderValue::from_static("[absent]"));

			let mut res = match req.uri().path() {
				"/hello" => Response::new(Body::from("hello from upstream")),
				"/redirect" => {
					let mut res = Response::new(Body::empty());
					*res.status_mut() = StatusCode::FOUND;
					res.headers_mut()
						.insert("Location", HeaderValue::from_static("http://example.com/"));
					res
				}
				_ => {
					let mut res = Response::new(Body::empty());
					*res.status_mut() = StatusCode::NOT_FOUND;
					res
				}
			};
			res.headers_mut().insert("echo-user-agent", user_agent);
			Ok::<_, hyper::Error>(res)
		}))
	});

	let server = HyperServer::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_service);
	let addr = server.local_addr();
	tokio::spawn(server);
	addr
}
