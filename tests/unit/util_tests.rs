//! Unit tests for port probing and fixture downloads.

use std::net::TcpListener;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use troupe::errors::HarnessError;
use troupe::util::{download_file, free_local_port};

/// Serve exactly one HTTP response on a fresh localhost port.
async fn serve_once(status_line: &'static str, body: &'static [u8]) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub server");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut request = [0_u8; 1024];
        let _ = socket.read(&mut request).await;
        let header = format!(
            "{status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        socket
            .write_all(header.as_bytes())
            .await
            .expect("write header");
        socket.write_all(body).await.expect("write body");
        socket.shutdown().await.expect("shutdown");
    });

    format!("http://{addr}/fixture.dna.json")
}

#[test]
fn free_local_port_returns_a_bindable_port() {
    let port = free_local_port().expect("probe port");
    TcpListener::bind(("127.0.0.1", port)).expect("port should be free to bind");
}

#[tokio::test]
async fn download_writes_the_remote_bytes() {
    let url = serve_once("HTTP/1.1 200 OK", b"{\"dna\":true}").await;
    let dir = tempfile::tempdir().expect("tempdir");
    let dest = dir.path().join("fixture.dna.json");

    download_file(&url, &dest, false).await.expect("download");
    assert_eq!(std::fs::read(&dest).expect("read dest"), b"{\"dna\":true}");
}

#[tokio::test]
async fn download_skips_existing_files_without_overwrite() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dest = dir.path().join("fixture.dna.json");
    std::fs::write(&dest, b"stale").expect("seed dest");

    // No server is listening; the URL must never be dereferenced.
    download_file("http://127.0.0.1:1/fixture.dna.json", &dest, false)
        .await
        .expect("skip download");
    assert_eq!(std::fs::read(&dest).expect("read dest"), b"stale");
}

#[tokio::test]
async fn download_overwrites_when_asked() {
    let url = serve_once("HTTP/1.1 200 OK", b"fresh").await;
    let dir = tempfile::tempdir().expect("tempdir");
    let dest = dir.path().join("fixture.dna.json");
    std::fs::write(&dest, b"stale").expect("seed dest");

    download_file(&url, &dest, true).await.expect("download");
    assert_eq!(std::fs::read(&dest).expect("read dest"), b"fresh");
}

#[tokio::test]
async fn download_surfaces_http_failures() {
    let url = serve_once("HTTP/1.1 404 Not Found", b"missing").await;
    let dir = tempfile::tempdir().expect("tempdir");
    let dest = dir.path().join("fixture.dna.json");

    let err = download_file(&url, &dest, false).await.expect_err("404");
    assert!(matches!(err, HarnessError::Download(_)));
    assert!(!dest.exists());
}
