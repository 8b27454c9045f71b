//! Integration tests for the TCP and WebSocket transports.
//!
//! These spin up a real listener on an OS-assigned port and a real client,
//! then verify bytes flow both ways through the split reader/writer halves.

use hearth_transport::{
    Connection, ConnectionReader, ConnectionWriter, TcpTransport, Transport,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn test_tcp_accept_and_send_receive() {
    let mut transport = TcpTransport::bind("127.0.0.1:0")
        .await
        .expect("should bind");
    let addr = transport.local_addr().expect("local addr");

    let server_handle =
        tokio::spawn(async move { transport.accept().await.expect("accept") });

    let mut client = tokio::net::TcpStream::connect(addr)
        .await
        .expect("client should connect");
    let server_conn = server_handle.await.expect("task should complete");
    assert!(server_conn.id().into_inner() > 0);

    let (mut reader, mut writer) = server_conn.split();

    writer.send(b"hello from server").await.expect("send");
    let mut buf = [0u8; 17];
    client.read_exact(&mut buf).await.expect("client read");
    assert_eq!(&buf, b"hello from server");

    client.write_all(b"hello from client").await.expect("client write");
    let mut received = Vec::new();
    while received.len() < 17 {
        let chunk = reader
            .recv()
            .await
            .expect("recv should succeed")
            .expect("should have data");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, b"hello from client");

    writer.close().await.expect("close should succeed");
}

#[tokio::test]
async fn test_tcp_recv_returns_none_on_client_close() {
    let mut transport = TcpTransport::bind("127.0.0.1:0")
        .await
        .expect("should bind");
    let addr = transport.local_addr().expect("local addr");

    let server_handle =
        tokio::spawn(async move { transport.accept().await.expect("accept") });
    let client = tokio::net::TcpStream::connect(addr).await.expect("connect");
    let (mut reader, _writer) = server_handle.await.unwrap().split();

    drop(client);

    let result = reader.recv().await.expect("recv should not error");
    assert!(result.is_none(), "should return None on client close");
}

#[cfg(feature = "websocket")]
mod websocket {
    use futures_util::{SinkExt, StreamExt};
    use hearth_transport::{
        Connection, ConnectionReader, ConnectionWriter, Transport,
        WebSocketTransport,
    };
    use tokio_tungstenite::tungstenite::Message;

    async fn connect_client(
        addr: std::net::SocketAddr,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .expect("client should connect");
        ws
    }

    #[tokio::test]
    async fn test_websocket_accept_and_send_receive() {
        let mut transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("local addr");

        let server_handle = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });
        let mut client_ws = connect_client(addr).await;
        let (mut reader, mut writer) =
            server_handle.await.expect("task should complete").split();

        writer.send(b"hello from server").await.expect("send");
        let msg = client_ws.next().await.unwrap().unwrap();
        assert_eq!(msg.into_data().as_ref(), b"hello from server");

        client_ws
            .send(Message::Binary(b"hello from client".to_vec().into()))
            .await
            .unwrap();
        let received = reader
            .recv()
            .await
            .expect("recv should succeed")
            .expect("should have data");
        assert_eq!(received, b"hello from client");

        writer.close().await.expect("close should succeed");
    }

    #[tokio::test]
    async fn test_websocket_recv_returns_none_on_client_close() {
        let mut transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("local addr");

        let server_handle = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });
        let mut client_ws = connect_client(addr).await;
        let (mut reader, _writer) = server_handle.await.unwrap().split();

        client_ws.send(Message::Close(None)).await.unwrap();

        let result = reader.recv().await.expect("recv should not error");
        assert!(result.is_none(), "should return None on client close");
    }
}
