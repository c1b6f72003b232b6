//! Local fake proxies for tests

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Build a raw HTTP/1.1 response with a correct Content-Length
pub fn http_response(status_line: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line,
        body.len(),
        body
    )
}

async fn read_request_head(stream: &mut TcpStream) -> String {
    let mut buf = [0u8; 4096];
    let mut head = Vec::new();
    loop {
        let n = stream.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// HTTP proxy answering every request through `respond(request_head)`
pub async fn spawn_proxy<F>(respond: F) -> SocketAddr
where
    F: Fn(&str) -> String + Send + Sync + Clone + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let respond = respond.clone();
            tokio::spawn(async move {
                let head = read_request_head(&mut stream).await;
                let _ = stream.write_all(respond(&head).as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    addr
}

/// HTTP proxy that always returns the same response
pub async fn spawn_static_proxy(response: String) -> SocketAddr {
    spawn_proxy(move |_| response.clone()).await
}

/// Proxy that accepts connections and never answers
pub async fn spawn_silent_proxy() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _held = stream;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });

    addr
}

/// Proxy that reads the request and hangs up without answering
pub async fn spawn_closing_proxy() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_request_head(&mut stream).await;
            });
        }
    });

    addr
}

/// Proxy that accepts CONNECT, then answers the TLS handshake with plain HTTP
pub async fn spawn_plaintext_tunnel_proxy() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_request_head(&mut stream).await;
                if stream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                // Wait for the ClientHello before replying with garbage
                let mut hello = [0u8; 1024];
                let _ = stream.read(&mut hello).await;
                let _ = stream.write_all(http_response("200 OK", "{}").as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    addr
}

/// SOCKS5 proxy that only accepts username/password authentication with the
/// given credentials, then answers the tunnelled request with `response`
pub async fn spawn_socks5_proxy(
    username: &'static str,
    password: &'static str,
    response: String,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let response = response.clone();
            tokio::spawn(async move {
                if let Ok(true) = socks5_handshake(&mut stream, username, password).await {
                    read_request_head(&mut stream).await;
                    let _ = stream.write_all(response.as_bytes()).await;
                }
                let _ = stream.shutdown().await;
            });
        }
    });

    addr
}

async fn socks5_handshake(stream: &mut TcpStream, username: &str, password: &str) -> io::Result<bool> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    if greeting[0] != 0x05 || !methods.contains(&0x02) {
        stream.write_all(&[0x05, 0xff]).await?;
        return Ok(false);
    }
    stream.write_all(&[0x05, 0x02]).await?;

    // RFC 1929: VER ULEN UNAME PLEN PASSWD
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let mut user = vec![0u8; header[1] as usize];
    stream.read_exact(&mut user).await?;
    let mut pass_len = [0u8; 1];
    stream.read_exact(&mut pass_len).await?;
    let mut pass = vec![0u8; pass_len[0] as usize];
    stream.read_exact(&mut pass).await?;

    let accepted = header[0] == 0x01 && user == username.as_bytes() && pass == password.as_bytes();
    stream.write_all(&[0x01, if accepted { 0x00 } else { 0x01 }]).await?;
    if !accepted {
        return Ok(false);
    }

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    let addr_len = match request[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        _ => return Ok(false),
    };
    let mut target = vec![0u8; addr_len + 2];
    stream.read_exact(&mut target).await?;

    stream.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
    Ok(true)
}

/// Address of a local port with nothing listening on it
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
