// SPDX-License-Identifier: MIT OR Apache-2.0

//! `fetch` subcommand: downloads one snapshot from every registered camera,
//! all cameras concurrently, each camera's failure isolated to its own task.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Error};
use chrono::Local;
use clap::Parser;
use futures::TryStreamExt;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::registry::{self, CameraEntry};
use crate::storage;

/// Upper bound on how much of a response body is held in memory at once.
const CHUNK_SIZE: usize = 1024;

#[derive(Parser)]
pub struct Opts {
    /// JSON file mapping camera names to snapshot URLs.
    #[arg(long, default_value = "camera_urls.json")]
    camera_list: PathBuf,

    /// Directory the per-camera snapshot directories are created under.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Per-request timeout, in seconds. Without one, an unresponsive camera
    /// stalls its own task until the connection dies; other cameras are
    /// unaffected either way.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Fetch every camera again each interval, in seconds, until Ctrl+C.
    /// Without this flag the process fetches once and exits (cron-friendly).
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,
}

pub async fn run(opts: Opts) -> Result<(), Error> {
    let cameras = registry::load(&opts.camera_list).await?;
    if cameras.is_empty() {
        info!(
            "camera registry {} is empty; nothing to fetch",
            opts.camera_list.display()
        );
        return Ok(());
    }

    // One shared client; workers borrow it rather than building their own,
    // so connections are pooled and tests can substitute endpoints.
    let mut builder = reqwest::Client::builder();
    if let Some(secs) = opts.timeout {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    let client = builder.build().context("unable to build HTTP client")?;

    loop {
        let failed = fetch_round(&client, &cameras, &opts.out_dir).await;
        let Some(secs) = opts.interval else {
            if failed > 0 {
                bail!("{failed} of {} cameras failed", cameras.len());
            }
            return Ok(());
        };
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping due to signal");
                return Ok(());
            }
        }
    }
}

/// Runs one full fan-out and reports the results. Returns the failure count.
async fn fetch_round(client: &reqwest::Client, cameras: &[CameraEntry], out_dir: &Path) -> usize {
    let outcomes = fetch_all(client, cameras, out_dir).await;
    let mut failed = 0;
    for (name, result) in &outcomes {
        match result {
            Ok(path) => debug!("{name}: saved {}", path.display()),
            Err(e) => {
                failed += 1;
                error!("{name}: {e:#}");
            }
        }
    }
    info!("fetched {} of {} cameras", outcomes.len() - failed, outcomes.len());
    failed
}

/// Fans out one fetch task per camera and waits for all of them.
///
/// This is a plain join, not a race: every camera runs to a terminal
/// outcome, and no camera's failure cancels or delays a sibling. Errors are
/// caught at the task boundary and returned alongside the camera name.
pub async fn fetch_all(
    client: &reqwest::Client,
    cameras: &[CameraEntry],
    out_dir: &Path,
) -> Vec<(String, Result<PathBuf, Error>)> {
    let tasks = cameras.iter().map(|camera| async move {
        let result = async {
            let dir = storage::camera_dir(out_dir, &camera.name).await?;
            fetch_one(client, camera, &dir).await
        }
        .await;
        (camera.name.clone(), result)
    });
    futures::future::join_all(tasks).await
}

/// Downloads one snapshot into `dir`, named by the wall clock at completion.
///
/// The body streams into a `.partial` file which is renamed into place only
/// once fully written, so a timestamped name never refers to a truncated
/// image, and the partial file is removed on failure.
async fn fetch_one(
    client: &reqwest::Client,
    camera: &CameraEntry,
    dir: &Path,
) -> Result<PathBuf, Error> {
    let tmp = dir.join("snapshot.jpg.partial");
    match download(client, &camera.url, &tmp).await {
        Ok(()) => {
            let path = dir.join(storage::snapshot_name(Local::now()));
            tokio::fs::rename(&tmp, &path)
                .await
                .with_context(|| format!("unable to move snapshot into {}", path.display()))?;
            Ok(path)
        }
        Err(e) => {
            if let Err(e) = tokio::fs::remove_file(&tmp).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("unable to remove partial file {}: {}", tmp.display(), e);
                }
            }
            Err(e)
        }
    }
}

/// Issues the GET and streams the body to `target` in bounded chunks,
/// written in arrival order.
async fn download(client: &reqwest::Client, url: &Url, target: &Path) -> Result<(), Error> {
    let resp = client
        .get(url.clone())
        .send()
        .await
        .context("request failed")?
        .error_for_status()
        .context("camera returned an error status")?;
    let mut body = StreamReader::new(resp.bytes_stream().map_err(std::io::Error::other));
    let mut file = File::create(target)
        .await
        .with_context(|| format!("unable to create {}", target.display()))?;
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = body
            .read(&mut chunk)
            .await
            .context("error reading image data")?;
        if n == 0 {
            break;
        }
        file.write_all(&chunk[..n])
            .await
            .with_context(|| format!("error writing {}", target.display()))?;
    }
    file.flush()
        .await
        .with_context(|| format!("error flushing {}", target.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Serves one canned HTTP response on a fresh loopback port, then exits.
    async fn serve_once(status: &'static str, body: Vec<u8>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = snapshot_url(&listener);
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            read_request(&mut sock).await;
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            sock.write_all(head.as_bytes()).await.unwrap();
            sock.write_all(&body).await.unwrap();
        });
        url
    }

    /// Accepts a connection and then never answers, holding the socket open.
    async fn serve_stalled() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = snapshot_url(&listener);
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            read_request(&mut sock).await;
            tokio::time::sleep(Duration::from_secs(600)).await;
        });
        url
    }

    /// Claims Content-Length `total` but closes after `sent` bytes.
    async fn serve_truncated(total: usize, sent: usize) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = snapshot_url(&listener);
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            read_request(&mut sock).await;
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {total}\r\n\r\n");
            sock.write_all(head.as_bytes()).await.unwrap();
            sock.write_all(&test_body(sent)).await.unwrap();
        });
        url
    }

    /// A port where connections are refused: bind to reserve it, then drop.
    async fn refused_url() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        snapshot_url(&listener)
    }

    fn snapshot_url(listener: &TcpListener) -> Url {
        format!("http://{}/snap.jpg", listener.local_addr().unwrap())
            .parse()
            .unwrap()
    }

    async fn read_request(sock: &mut TcpStream) {
        let mut buf = [0u8; 1024];
        let mut seen = Vec::new();
        loop {
            let n = sock.read(&mut buf).await.unwrap();
            seen.extend_from_slice(&buf[..n]);
            if n == 0 || seen.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
    }

    fn entry(name: &str, url: Url) -> CameraEntry {
        CameraEntry {
            name: name.to_owned(),
            url,
        }
    }

    fn test_body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn body_is_reconstructed_exactly() {
        // 1023/1024/1025 probe the chunk-size boundary; 10240 spans many
        // chunks.
        let base = tempfile::tempdir().unwrap();
        let client = reqwest::Client::new();
        for (i, len) in [1023usize, 1024, 1025, 10240].into_iter().enumerate() {
            let body = test_body(len);
            let url = serve_once("200 OK", body.clone()).await;
            let cameras = [entry(&format!("cam{i}"), url)];
            let outcomes = fetch_all(&client, &cameras, base.path()).await;
            let (_, result) = &outcomes[0];
            let path = result.as_ref().unwrap();
            assert_eq!(tokio::fs::read(path).await.unwrap(), body, "len {len}");
        }
    }

    #[tokio::test]
    async fn every_camera_reaches_a_terminal_state() {
        let base = tempfile::tempdir().unwrap();
        let client = reqwest::Client::new();
        let cameras = [
            entry("good-a", serve_once("200 OK", test_body(100)).await),
            entry("refused", refused_url().await),
            entry("good-b", serve_once("200 OK", test_body(200)).await),
            entry("not-found", serve_once("404 Not Found", Vec::new()).await),
            entry("good-c", serve_once("200 OK", test_body(300)).await),
        ];
        let outcomes = fetch_all(&client, &cameras, base.path()).await;
        assert_eq!(outcomes.len(), cameras.len());
        for (name, result) in &outcomes {
            match name.as_str() {
                "refused" | "not-found" => assert!(result.is_err(), "{name}"),
                _ => assert!(result.is_ok(), "{name}: {result:?}"),
            }
        }
    }

    #[tokio::test]
    async fn empty_registry_produces_zero_outcomes() {
        let base = tempfile::tempdir().unwrap();
        let client = reqwest::Client::new();
        let outcomes = fetch_all(&client, &[], base.path()).await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn stalled_camera_does_not_block_others() {
        let base = tempfile::tempdir().unwrap();
        // The stalled worker only reaches a terminal state because this
        // client has a timeout; without one it would hold its slot open,
        // still without affecting the fast cameras.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        let cameras = [
            entry("fast-a", serve_once("200 OK", test_body(100)).await),
            entry("stalled", serve_stalled().await),
            entry("fast-b", serve_once("200 OK", test_body(100)).await),
        ];
        let outcomes = fetch_all(&client, &cameras, base.path()).await;
        assert_eq!(outcomes.len(), 3);
        for (name, result) in &outcomes {
            match name.as_str() {
                "stalled" => assert!(result.is_err()),
                _ => assert!(result.is_ok(), "{name}: {result:?}"),
            }
        }
    }

    #[tokio::test]
    async fn midstream_disconnect_leaves_no_file_behind() {
        let base = tempfile::tempdir().unwrap();
        let client = reqwest::Client::new();
        let cameras = [entry("drops", serve_truncated(100_000, 1_000).await)];
        let outcomes = fetch_all(&client, &cameras, base.path()).await;
        assert!(outcomes[0].1.is_err());
        // Partial download was cleaned up; the directory itself remains.
        let dir = base.path().join("drops");
        assert!(dir.is_dir());
        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_lands_under_the_camera_directory() {
        let base = tempfile::tempdir().unwrap();
        let client = reqwest::Client::new();
        let cameras = [entry("ridge", serve_once("200 OK", test_body(64)).await)];
        let outcomes = fetch_all(&client, &cameras, base.path()).await;
        let path = outcomes[0].1.as_ref().unwrap();
        assert_eq!(path.parent().unwrap(), base.path().join("ridge"));
        let name = path.file_name().unwrap().to_str().unwrap();
        // YYYY_MM_DD_HH_MM_SS.jpg
        assert_eq!(name.len(), "2024_01_02_03_04_05.jpg".len());
        assert!(name.ends_with(".jpg"));
    }
}
