//! End-to-end SOCKS4, SOCKS4a, and SOCKS5 tests against a live server

mod util;

use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream},
};

/// A port that was bound and released, so nothing is listening on it
async fn dead_port() -> u16 {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	drop(listener);
	port
}

#[tokio::test]
async fn socks5_connect_and_forward() {
	let echo = util::start_echo().await;
	let proxy = util::start_proxy("").await;

	let mut conn = TcpStream::connect(proxy).await.unwrap();

	// greeting: version 5, one method, "no authentication"
	conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
	let mut method = [0_u8; 2];
	conn.read_exact(&mut method).await.unwrap();
	assert_eq!(method, [0x05, 0x00]);

	// request: CONNECT 127.0.0.1:<echo port>
	let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
	request.extend_from_slice(&echo.port().to_be_bytes());
	conn.write_all(&request).await.unwrap();

	let mut reply = [0_u8; 10];
	conn.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[0], 0x05);
	assert_eq!(reply[1], 0x00, "request granted");
	assert_eq!(reply[2], 0x00);
	assert_eq!(reply[3], 0x01, "bound address is IPv4");

	conn.write_all(b"ping").await.unwrap();
	let mut pong = [0_u8; 4];
	conn.read_exact(&mut pong).await.unwrap();
	assert_eq!(&pong, b"ping");
}

#[tokio::test]
async fn socks5_domain_destination() {
	let echo = util::start_echo().await;
	let proxy = util::start_proxy("").await;

	let mut conn = TcpStream::connect(proxy).await.unwrap();
	conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
	let mut method = [0_u8; 2];
	conn.read_exact(&mut method).await.unwrap();

	let host = b"localhost";
	let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
	request.extend_from_slice(host);
	request.extend_from_slice(&echo.port().to_be_bytes());
	conn.write_all(&request).await.unwrap();

	let mut reply = [0_u8; 10];
	conn.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[1], 0x00);

	conn.write_all(b"by name").await.unwrap();
	let mut back = [0_u8; 7];
	conn.read_exact(&mut back).await.unwrap();
	assert_eq!(&back, b"by name");
}

#[tokio::test]
async fn socks5_without_noauth_is_turned_away() {
	let proxy = util::start_proxy("").await;

	let mut conn = TcpStream::connect(proxy).await.unwrap();
	// only username/password on offer
	conn.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

	let mut reply = [0_u8; 2];
	conn.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply, [0x05, 0xFF]);

	// the server closes without reading anything further
	let mut rest = Vec::new();
	conn.read_to_end(&mut rest).await.unwrap();
	assert!(rest.is_empty());
}

#[tokio::test]
async fn socks5_rejects_non_connect_commands() {
	let proxy = util::start_proxy("").await;

	let mut conn = TcpStream::connect(proxy).await.unwrap();
	conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
	let mut method = [0_u8; 2];
	conn.read_exact(&mut method).await.unwrap();

	// BIND is not supported; the reply comes before the address is read
	conn.write_all(&[0x05, 0x02, 0x00, 0x01]).await.unwrap();

	let mut reply = [0_u8; 10];
	conn.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[1], 0x07, "command not supported");
}

#[tokio::test]
async fn socks5_rejects_unknown_address_types() {
	let proxy = util::start_proxy("").await;

	let mut conn = TcpStream::connect(proxy).await.unwrap();
	conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
	let mut method = [0_u8; 2];
	conn.read_exact(&mut method).await.unwrap();

	conn.write_all(&[0x05, 0x01, 0x00, 0x09]).await.unwrap();

	let mut reply = [0_u8; 10];
	conn.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[1], 0x08, "address type not supported");
}

#[tokio::test]
async fn socks5_refused_dial_maps_to_reply_code() {
	let port = dead_port().await;
	let proxy = util::start_proxy("").await;

	let mut conn = TcpStream::connect(proxy).await.unwrap();
	conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
	let mut method = [0_u8; 2];
	conn.read_exact(&mut method).await.unwrap();

	let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
	request.extend_from_slice(&port.to_be_bytes());
	conn.write_all(&request).await.unwrap();

	let mut reply = [0_u8; 10];
	conn.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[1], 0x05, "connection refused");
}

#[tokio::test]
async fn socks4_connect_and_forward() {
	let echo = util::start_echo().await;
	let proxy = util::start_proxy("").await;

	let mut conn = TcpStream::connect(proxy).await.unwrap();

	let mut request = vec![0x04, 0x01];
	request.extend_from_slice(&echo.port().to_be_bytes());
	request.extend_from_slice(&[127, 0, 0, 1]);
	request.push(0x00); // empty user-id
	conn.write_all(&request).await.unwrap();

	let mut reply = [0_u8; 8];
	conn.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply, [0x00, 90, 0, 0, 0, 0, 0, 0], "request granted");

	conn.write_all(b"legacy").await.unwrap();
	let mut back = [0_u8; 6];
	conn.read_exact(&mut back).await.unwrap();
	assert_eq!(&back, b"legacy");
}

#[tokio::test]
async fn socks4a_domain_destination() {
	let echo = util::start_echo().await;
	let proxy = util::start_proxy("").await;

	let mut conn = TcpStream::connect(proxy).await.unwrap();

	// marker address 0.0.0.1 announces a domain after the user-id
	let mut request = vec![0x04, 0x01];
	request.extend_from_slice(&echo.port().to_be_bytes());
	request.extend_from_slice(&[0, 0, 0, 1]);
	request.extend_from_slice(b"user\0");
	request.extend_from_slice(b"localhost\0");
	conn.write_all(&request).await.unwrap();

	let mut reply = [0_u8; 8];
	conn.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[1], 90, "request granted");

	conn.write_all(b"4a").await.unwrap();
	let mut back = [0_u8; 2];
	conn.read_exact(&mut back).await.unwrap();
	assert_eq!(&back, b"4a");
}

#[tokio::test]
async fn socks4_rejects_non_connect_commands() {
	let proxy = util::start_proxy("").await;

	let mut conn = TcpStream::connect(proxy).await.unwrap();
	// BIND; the rejection comes before the user-id is read
	conn.write_all(&[0x04, 0x02, 0x00, 0x50, 127, 0, 0, 1])
		.await
		.unwrap();

	let mut reply = [0_u8; 8];
	conn.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[1], 91, "request rejected");
}

#[tokio::test]
async fn socks4_over_long_user_id_is_rejected() {
	let proxy = util::start_proxy("").await;

	let mut conn = TcpStream::connect(proxy).await.unwrap();
	let mut request = vec![0x04, 0x01, 0x00, 0x50, 127, 0, 0, 1];
	// a user-id that never terminates within its 128-byte bound
	request.extend_from_slice(&[b'a'; 128]);
	conn.write_all(&request).await.unwrap();

	let mut reply = [0_u8; 8];
	conn.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[1], 91, "request rejected");

	let mut rest = Vec::new();
	conn.read_to_end(&mut rest).await.unwrap();
	assert!(rest.is_empty());
}

#[tokio::test]
async fn socks4_refused_dial_replies_91() {
	let port = dead_port().await;
	let proxy = util::start_proxy("").await;

	let mut conn = TcpStream::connect(proxy).await.unwrap();
	let mut request = vec![0x04, 0x01];
	request.extend_from_slice(&port.to_be_bytes());
	request.extend_from_slice(&[127, 0, 0, 1]);
	request.push(0x00);
	conn.write_all(&request).await.unwrap();

	let mut reply = [0_u8; 8];
	conn.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[1], 91);
}

#[tokio::test]
async fn socks5_routed_through_socks5_upstream() {
	let echo = util::start_echo().await;
	// a second muxproxy instance acts as the SOCKS5 upstream
	let upstream = util::start_proxy("").await;
	let proxy = util::start_proxy(&format!(
		".localhost socks5://127.0.0.1:{}\n* direct\n",
		upstream.port()
	))
	.await;

	let mut conn = TcpStream::connect(proxy).await.unwrap();
	conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
	let mut method = [0_u8; 2];
	conn.read_exact(&mut method).await.unwrap();

	// "localhost" matches the .localhost suffix rule
	let host = b"localhost";
	let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
	request.extend_from_slice(host);
	request.extend_from_slice(&echo.port().to_be_bytes());
	conn.write_all(&request).await.unwrap();

	let mut reply = [0_u8; 10];
	conn.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[1], 0x00, "request granted via the upstream");

	conn.write_all(b"hop hop").await.unwrap();
	let mut back = [0_u8; 7];
	conn.read_exact(&mut back).await.unwrap();
	assert_eq!(&back, b"hop hop");
}
