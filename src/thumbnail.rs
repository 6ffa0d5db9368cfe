//! Thumbnail images: a plain HTTP download, no yt-dlp involved.

use std::path::Path;
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;

const THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(60);

/// Download `image_url` to `output_path`, reporting percent when the server sends a length.
///
/// Returns `Cancelled` as soon as the token fires. A partial file is left for the
/// caller's cleanup.
pub async fn fetch_thumbnail<F>(
    image_url: &str,
    output_path: &Path,
    cancel: CancellationToken,
    mut on_progress: F,
) -> Result<(), DownloadError>
where
    F: FnMut(f64),
{
    let client = reqwest::Client::builder().timeout(THUMBNAIL_TIMEOUT).build()?;
    log::info!("Fetching thumbnail {} -> {}", image_url, output_path.display());

    let mut response = tokio::select! {
        biased;

        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        response = client.get(image_url).send() => response?.error_for_status()?,
    };
    let total = response.content_length().filter(|len| *len > 0);

    let mut file = fs::File::create(output_path).await?;
    let mut received: u64 = 0;
    loop {
        let chunk = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            chunk = response.chunk() => chunk?,
        };
        let Some(chunk) = chunk else {
            break;
        };

        file.write_all(&chunk).await?;
        received += chunk.len() as u64;
        if let Some(total) = total {
            // 100 is reported by the task once the run has succeeded.
            on_progress((received as f64 / total as f64 * 100.0).min(99.9));
        }
    }
    file.flush().await?;

    log::info!("Saved thumbnail ({} bytes) to {}", received, output_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Answer a single request with `status` and `body`; returns the image URL.
    async fn serve_once(status: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/vi/abc/maxresdefault.jpg")
    }

    #[tokio::test]
    async fn test_fetch_writes_image_and_reports_progress() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("Clip - 1280x720.jpg");
        let body: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let url = serve_once("200 OK", body.clone()).await;

        let mut seen = Vec::new();
        fetch_thumbnail(&url, &output, CancellationToken::new(), |p| seen.push(p))
            .await
            .unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), body);
        assert!(!seen.is_empty());
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen.iter().all(|p| *p <= 99.9));
    }

    #[tokio::test]
    async fn test_fetch_maps_http_error_status() {
        let dir = TempDir::new().unwrap();
        let url = serve_once("404 Not Found", b"gone".to_vec()).await;

        let err = fetch_thumbnail(&url, &dir.path().join("x.jpg"), CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Http(_)), "{err:?}");
        assert!(!dir.path().join("x.jpg").exists());
    }

    #[tokio::test]
    async fn test_fetch_honours_cancellation() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetch_thumbnail("http://127.0.0.1:9/x.jpg", &dir.path().join("x.jpg"), cancel, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
    }
}
