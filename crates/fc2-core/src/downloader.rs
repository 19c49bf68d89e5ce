//! HLS segmented downloader (component D): playlist poll, bounded worker
//! pool, ordered reassembly.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::Client;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::DownloadError;

const QUEUE_CAPACITY: usize = 100;
const MAX_FRAGMENT_ATTEMPTS: u32 = 5;
const STALL_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

struct UrlJob {
    index: u64,
    url: String,
    attempts: u32,
}

impl PartialEq for UrlJob {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl Eq for UrlJob {}
impl PartialOrd for UrlJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for UrlJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

struct Payload {
    index: u64,
    bytes: Bytes,
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl Eq for Payload {}
impl PartialOrd for Payload {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Payload {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

/// A bounded, index-ordered queue. Backed by a min-heap so the ordered
/// reader can peek the lowest pending index without the pop-then-reinsert
/// dance a literal priority-queue port would need.
struct IndexedQueue<T: Ord> {
    heap: Mutex<BinaryHeap<Reverse<T>>>,
    notify: Notify,
    permits: Semaphore,
    closed: AtomicBool,
}

impl<T: Ord> IndexedQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            permits: Semaphore::new(capacity),
            closed: AtomicBool::new(false),
        }
    }

    async fn push(&self, item: T) {
        let permit = self.permits.acquire().await;
        let Ok(permit) = permit else { return };
        permit.forget();
        self.heap.lock().unwrap().push(Reverse(item));
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

impl IndexedQueue<UrlJob> {
    /// Pop any job (workers don't care about order, only availability).
    async fn pop_any(&self) -> Option<UrlJob> {
        loop {
            {
                let mut heap = self.heap.lock().unwrap();
                if let Some(Reverse(job)) = heap.pop() {
                    self.permits.add_permits(1);
                    return Some(job);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }
}

impl IndexedQueue<Payload> {
    /// Block until the minimum-index item equals `cursor`, then return it.
    /// Returns `None` once the queue is closed and drained.
    async fn take_matching(&self, cursor: u64) -> Option<Bytes> {
        loop {
            {
                let mut heap = self.heap.lock().unwrap();
                if let Some(Reverse(top)) = heap.peek() {
                    if top.index == cursor {
                        let item = heap.pop().unwrap().0;
                        self.permits.add_permits(1);
                        return Some(item.bytes);
                    }
                } else if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// Scoped resource streaming ordered HLS fragment payloads from a media
/// playlist URL. Release cancels the poller and all workers.
pub struct HlsDownloader {
    cursor: Mutex<u64>,
    payloads: Arc<IndexedQueue<Payload>>,
    cancel: CancellationToken,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl HlsDownloader {
    /// Construct and start the poller and worker pool immediately.
    pub fn start(client: Client, media_playlist_url: String, threads: usize) -> Self {
        if threads > 8 {
            warn!(threads, "using more than 8 threads is not recommended");
        }

        let urls: Arc<IndexedQueue<UrlJob>> = Arc::new(IndexedQueue::new(QUEUE_CAPACITY));
        let payloads: Arc<IndexedQueue<Payload>> = Arc::new(IndexedQueue::new(QUEUE_CAPACITY));
        let cancel = CancellationToken::new();

        // Tracks the poller plus every worker so `payloads` is closed once all
        // of them have exited, whether that's a natural end-of-stream (poller
        // hits 403/stalls, `urls` drains) or an external cancellation -
        // otherwise `read_next` would block on `payloads` forever after the
        // last fragment.
        let producers_remaining = Arc::new(std::sync::atomic::AtomicUsize::new(threads.max(1) + 1));

        let mut tasks = Vec::with_capacity(threads + 1);

        let poller_cancel = cancel.clone();
        let poller_client = client.clone();
        let poller_urls = urls.clone();
        let poller_payloads = payloads.clone();
        let poller_remaining = producers_remaining.clone();
        tasks.push(tokio::spawn(async move {
            poll_playlist(poller_client, media_playlist_url, poller_urls, poller_cancel).await;
            close_payloads_when_done(&poller_remaining, &poller_payloads);
        }));

        if threads > 1 {
            debug!(threads, "downloading with multiple threads");
        }

        for worker_id in 0..threads.max(1) {
            let worker_cancel = cancel.clone();
            let worker_client = client.clone();
            let worker_urls = urls.clone();
            let worker_payloads = payloads.clone();
            let worker_remaining = producers_remaining.clone();
            tasks.push(tokio::spawn(async move {
                download_worker(worker_id, worker_client, worker_urls, worker_payloads.clone(), worker_cancel)
                    .await;
                close_payloads_when_done(&worker_remaining, &worker_payloads);
            }));
        }

        Self {
            cursor: Mutex::new(0),
            payloads,
            cancel,
            tasks: Mutex::new(Some(tasks)),
        }
    }

    /// Read the next fragment in order, or `None` at end of stream.
    pub async fn read_next(&self) -> Option<Bytes> {
        let cursor = {
            let mut c = self.cursor.lock().unwrap();
            let current = *c;
            *c += 1;
            current
        };
        self.payloads.take_matching(cursor).await
    }

    /// Cancel the poller and all workers and await their exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.payloads.close();
        let tasks = self.tasks.lock().unwrap().take();
        if let Some(tasks) = tasks {
            for task in tasks {
                let _ = task.await;
            }
        }
    }
}

impl Drop for HlsDownloader {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.payloads.close();
        if let Some(tasks) = self.tasks.lock().unwrap().take() {
            for task in tasks {
                task.abort();
            }
        }
    }
}

/// Decrement the shared producer count; once every poller/worker has
/// exited, close `payloads` so the ordered reader stops blocking.
fn close_payloads_when_done(remaining: &std::sync::atomic::AtomicUsize, payloads: &IndexedQueue<Payload>) {
    if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
        payloads.close();
    }
}

async fn poll_playlist(
    client: Client,
    url: String,
    urls: Arc<IndexedQueue<UrlJob>>,
    cancel: CancellationToken,
) {
    let mut last_fragment: Option<String> = None;
    let mut frag_idx: u64 = 0;
    let mut last_new_fragment_at = Instant::now();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let frags = match fetch_fragment_urls(&client, &url).await {
            Ok(frags) => frags,
            Err(DownloadError::StreamEnded) => {
                debug!("playlist fetch returned 403, stream ended");
                break;
            }
            Err(e) => {
                error!(error = %e, "error fetching playlist");
                break;
            }
        };

        let new_idx = last_fragment
            .as_ref()
            .and_then(|last| frags.iter().position(|f| f == last).map(|p| p + 1))
            .unwrap_or(0);

        let new_fragments = &frags[new_idx.min(frags.len())..];
        if !new_fragments.is_empty() {
            last_new_fragment_at = Instant::now();
            trace!(count = new_fragments.len(), "found new fragments");
        }

        for frag in new_fragments {
            last_fragment = Some(frag.clone());
            urls.push(UrlJob {
                index: frag_idx,
                url: frag.clone(),
                attempts: 0,
            })
            .await;
            frag_idx += 1;
        }

        if last_new_fragment_at.elapsed() > STALL_TIMEOUT {
            debug!("timeout receiving new segments");
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }
    }

    urls.close();
}

async fn fetch_fragment_urls(client: &Client, url: &str) -> Result<Vec<String>, DownloadError> {
    let resp = client.get(url).send().await?;
    match resp.status().as_u16() {
        403 => Err(DownloadError::StreamEnded),
        404 => Ok(Vec::new()),
        _ => {
            let text = resp.text().await?;
            Ok(text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect())
        }
    }
}

async fn download_worker(
    worker_id: usize,
    client: Client,
    urls: Arc<IndexedQueue<UrlJob>>,
    payloads: Arc<IndexedQueue<Payload>>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            job = urls.pop_any() => job,
            _ = cancel.cancelled() => break,
        };

        let Some(mut job) = job else {
            break;
        };

        trace!(worker_id, index = job.index, "downloading fragment");
        match client.get(&job.url).send().await {
            Ok(resp) if resp.status().as_u16() <= 299 => match resp.bytes().await {
                Ok(bytes) => {
                    payloads.push(Payload { index: job.index, bytes }).await;
                }
                Err(e) => {
                    error!(worker_id, index = job.index, error = %e, "failed to read fragment body");
                }
            },
            Ok(resp) => {
                let status = resp.status();
                error!(worker_id, index = job.index, %status, "fragment errored");
                job.attempts += 1;
                if job.attempts < MAX_FRAGMENT_ATTEMPTS {
                    urls.push(job).await;
                } else {
                    error!(worker_id, index = job.index, "gave up on fragment after max attempts");
                    payloads
                        .push(Payload {
                            index: job.index,
                            bytes: Bytes::new(),
                        })
                        .await;
                }
            }
            Err(e) => {
                error!(worker_id, error = %e, "unhandled fragment fetch error");
            }
        }
    }
    debug!(worker_id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_payloads_when_done_waits_for_every_producer() {
        let remaining = std::sync::atomic::AtomicUsize::new(2);
        let payloads: IndexedQueue<Payload> = IndexedQueue::new(QUEUE_CAPACITY);
        close_payloads_when_done(&remaining, &payloads);
        assert!(!payloads.closed.load(Ordering::SeqCst));
        close_payloads_when_done(&remaining, &payloads);
        assert!(payloads.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn ordered_reader_reorders_out_of_order_payloads() {
        let queue: IndexedQueue<Payload> = IndexedQueue::new(QUEUE_CAPACITY);
        queue
            .push(Payload { index: 2, bytes: Bytes::from_static(b"B") })
            .await;
        queue
            .push(Payload { index: 0, bytes: Bytes::from_static(b"A") })
            .await;
        queue
            .push(Payload { index: 1, bytes: Bytes::new() })
            .await;

        assert_eq!(queue.take_matching(0).await, Some(Bytes::from_static(b"A")));
        assert_eq!(queue.take_matching(1).await, Some(Bytes::new()));
        assert_eq!(queue.take_matching(2).await, Some(Bytes::from_static(b"B")));
    }

    #[tokio::test]
    async fn closed_empty_queue_returns_none() {
        let queue: IndexedQueue<Payload> = IndexedQueue::new(QUEUE_CAPACITY);
        queue.close();
        assert_eq!(queue.take_matching(0).await, None);
    }
}
