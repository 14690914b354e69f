//! Background reader and the answer table it fills.

use crate::frame::{FrameReader, PacketType, Response};
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Pause between two lookups of a pending answer.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Unclaimed answers further than this many ids from the newest one are discarded.
pub(crate) const MAX_UNCLAIMED_ANSWERS: usize = 1024;

/// Owns the inbound half of a connection and drains it on a background task.
#[derive(Debug)]
pub(crate) struct ResponseReader {
    answers: Answers,
    task: Option<JoinHandle<()>>,
}

/// Shared view of one reader's answer table.
///
/// Stays valid after the reader is disposed; lookups then only see what arrived before.
#[derive(Debug, Clone)]
pub(crate) struct Answers {
    shared: Arc<AnswerTable>,
}

#[derive(Debug)]
struct AnswerTable {
    table: DashMap<i32, Response>,
    alive: AtomicBool,
    auth_rejected: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LoginAnswer {
    Accepted,
    Rejected,
    TimedOut,
}

impl ResponseReader {
    pub fn spawn<R>(read: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let answers = Answers::new();
        let task_answers = answers.clone();

        let task = tokio::spawn(async move {
            let mut reader = FrameReader::new(read);
            loop {
                match reader.receive().await {
                    Ok(response) => task_answers.publish(response),
                    Err(err) => {
                        warn!("Response reader stopped: {}", err);
                        break;
                    }
                }
            }
            task_answers.shared.alive.store(false, Ordering::SeqCst);
        });

        ResponseReader {
            answers,
            task: Some(task),
        }
    }

    pub fn answers(&self) -> &Answers {
        &self.answers
    }

    pub fn is_alive(&self) -> bool {
        self.answers.is_alive()
    }

    /// Stops the background task and drops the stream it owns. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Response reader disposed");
        }
        self.answers.shared.alive.store(false, Ordering::SeqCst);
    }
}

impl Drop for ResponseReader {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// `None` when there is no timeout, or when it reaches past what `Instant` can hold.
fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

/// Distance between two ids on the `1..=i32::MAX` cycle the generator wraps around.
fn id_distance(a: i32, b: i32) -> i64 {
    let cycle = i32::MAX as i64;
    let forward = (a as i64 - b as i64).rem_euclid(cycle);
    forward.min(cycle - forward)
}

impl Answers {
    fn new() -> Self {
        Answers {
            shared: Arc::new(AnswerTable {
                table: DashMap::new(),
                alive: AtomicBool::new(true),
                auth_rejected: AtomicBool::new(false),
            }),
        }
    }

    fn publish(&self, response: Response) {
        let id = response.id;
        debug!(
            "Received packet id={} type={} ({} bytes)",
            id,
            response.kind,
            response.payload.len()
        );

        if response.is_empty() {
            if response.kind == PacketType::AUTH_RESPONSE {
                self.shared.auth_rejected.store(true, Ordering::SeqCst);
            }
            return;
        }

        let table = &self.shared.table;
        table.insert(id, response);

        if table.len() > MAX_UNCLAIMED_ANSWERS {
            let window = MAX_UNCLAIMED_ANSWERS as i64;
            table.retain(|other, _| id_distance(id, *other) <= window);
        }
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub fn auth_rejected(&self) -> bool {
        self.shared.auth_rejected.load(Ordering::SeqCst)
    }

    /// Removes and returns the answer for `id`, or the empty response if none is there.
    pub fn get_answer(&self, id: i32) -> Response {
        self.take(id).unwrap_or_else(Response::empty)
    }

    fn take(&self, id: i32) -> Option<Response> {
        self.shared.table.remove(&id).map(|(_, response)| response)
    }

    #[cfg(test)]
    pub(crate) fn unclaimed(&self) -> usize {
        self.shared.table.len()
    }

    /// Polls for the answer to `id` until it arrives, the reader stops or `timeout` passes.
    pub async fn wait_for(&self, id: i32, timeout: Option<Duration>) -> Response {
        let deadline = deadline_after(timeout);

        loop {
            if let Some(response) = self.take(id) {
                return response;
            }

            if !self.is_alive() {
                debug!("Reader gone while waiting for id={}", id);
                return self.get_answer(id);
            }

            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                debug!("Timed out waiting for id={}", id);
                return Response::empty();
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Polls for the server's verdict on the login request `id`.
    ///
    /// Source servers precede the verdict with an empty `RESPONSE_VALUE` echoing the id, which
    /// is skipped. A rejection arrives as an `AUTH_RESPONSE` with id -1; a server that hangs up
    /// instead counts as a rejection too.
    pub async fn wait_for_login(&self, id: i32, timeout: Option<Duration>) -> LoginAnswer {
        let deadline = deadline_after(timeout);

        loop {
            if self.auth_rejected() {
                return LoginAnswer::Rejected;
            }

            if let Some(response) = self.take(id) {
                let preamble =
                    response.kind == PacketType::RESPONSE_VALUE && response.payload.is_empty();
                if !preamble {
                    return LoginAnswer::Accepted;
                }
                continue;
            }

            if !self.is_alive() {
                return LoginAnswer::Rejected;
            }

            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return LoginAnswer::TimedOut;
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::serialize_packet;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    fn packet(id: i32, kind: PacketType, payload: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        serialize_packet(id, kind, payload, &mut buf).unwrap();
        buf
    }

    fn reader() -> (ResponseReader, DuplexStream) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        (ResponseReader::spawn(client), server)
    }

    #[tokio::test]
    async fn answers_are_matched_by_id() {
        let (reader, mut server) = reader();
        server
            .write_all(&packet(2, PacketType::RESPONSE_VALUE, "B"))
            .await
            .unwrap();
        server
            .write_all(&packet(1, PacketType::RESPONSE_VALUE, "A"))
            .await
            .unwrap();

        let timeout = Some(Duration::from_secs(1));
        let answers = reader.answers();
        assert_eq!(answers.wait_for(1, timeout).await.payload, "A");
        assert_eq!(answers.wait_for(2, timeout).await.payload, "B");
    }

    #[tokio::test]
    async fn answers_are_delivered_once() {
        let (reader, mut server) = reader();
        server
            .write_all(&packet(9, PacketType::RESPONSE_VALUE, "once"))
            .await
            .unwrap();

        let answers = reader.answers();
        assert_eq!(answers.wait_for(9, None).await.payload, "once");
        assert!(answers.get_answer(9).is_empty());
    }

    #[tokio::test]
    async fn later_packet_overwrites_unclaimed_one() {
        let (reader, mut server) = reader();
        server
            .write_all(&packet(4, PacketType::RESPONSE_VALUE, "stale"))
            .await
            .unwrap();
        server
            .write_all(&packet(4, PacketType::RESPONSE_VALUE, "fresh"))
            .await
            .unwrap();
        server
            .write_all(&packet(5, PacketType::RESPONSE_VALUE, "marker"))
            .await
            .unwrap();

        let answers = reader.answers();
        answers.wait_for(5, Some(Duration::from_secs(1))).await;
        assert_eq!(answers.get_answer(4).payload, "fresh");
    }

    #[tokio::test]
    async fn timeout_returns_empty() {
        let (reader, _server) = reader();
        let started = Instant::now();
        let answer = reader
            .answers()
            .wait_for(1, Some(Duration::from_millis(50)))
            .await;

        assert!(answer.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn closed_stream_releases_waiters() {
        let (reader, server) = reader();
        drop(server);

        // Would wait forever if the reader did not mark itself closed
        let answer = reader.answers().wait_for(1, None).await;
        assert!(answer.is_empty());
        assert!(!reader.is_alive());
    }

    #[tokio::test]
    async fn malformed_frame_stops_reader() {
        let (reader, mut server) = reader();
        server.write_all(&3i32.to_le_bytes()).await.unwrap();

        let answer = reader.answers().wait_for(1, Some(Duration::from_secs(1))).await;
        assert!(answer.is_empty());
        assert!(!reader.is_alive());
    }

    #[tokio::test]
    async fn sentinel_id_is_never_stored() {
        let (reader, mut server) = reader();
        server
            .write_all(&packet(-1, PacketType::RESPONSE_VALUE, "nobody"))
            .await
            .unwrap();
        server
            .write_all(&packet(1, PacketType::RESPONSE_VALUE, "marker"))
            .await
            .unwrap();

        let answers = reader.answers();
        answers.wait_for(1, Some(Duration::from_secs(1))).await;
        assert_eq!(answers.unclaimed(), 0);
        assert!(!answers.auth_rejected());
    }

    #[tokio::test]
    async fn login_skips_preamble() {
        let (reader, mut server) = reader();
        server
            .write_all(&packet(3, PacketType::RESPONSE_VALUE, ""))
            .await
            .unwrap();
        server
            .write_all(&packet(3, PacketType::AUTH_RESPONSE, ""))
            .await
            .unwrap();

        let answer = reader
            .answers()
            .wait_for_login(3, Some(Duration::from_secs(1)))
            .await;
        assert_eq!(answer, LoginAnswer::Accepted);
    }

    #[tokio::test]
    async fn login_rejection() {
        let (reader, mut server) = reader();
        server
            .write_all(&packet(3, PacketType::RESPONSE_VALUE, ""))
            .await
            .unwrap();
        server
            .write_all(&packet(-1, PacketType::AUTH_RESPONSE, ""))
            .await
            .unwrap();

        let answer = reader
            .answers()
            .wait_for_login(3, Some(Duration::from_secs(1)))
            .await;
        assert_eq!(answer, LoginAnswer::Rejected);
    }

    #[tokio::test]
    async fn login_timeout() {
        let (reader, _server) = reader();
        let answer = reader
            .answers()
            .wait_for_login(3, Some(Duration::from_millis(20)))
            .await;
        assert_eq!(answer, LoginAnswer::TimedOut);
    }

    #[tokio::test]
    async fn abandoned_answers_are_pruned() {
        let (reader, mut server) = reader();
        let total = MAX_UNCLAIMED_ANSWERS as i32 * 2;
        for id in 1..=total {
            server
                .write_all(&packet(id, PacketType::RESPONSE_VALUE, "x"))
                .await
                .unwrap();
        }

        let answers = reader.answers();
        while answers.unclaimed() < MAX_UNCLAIMED_ANSWERS
            || answers.shared.table.get(&total).is_none()
        {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        assert!(answers.unclaimed() <= MAX_UNCLAIMED_ANSWERS + 1);
        assert!(answers.get_answer(1).is_empty());
        assert_eq!(answers.get_answer(total).payload, "x");
    }

    #[tokio::test]
    async fn unrepresentable_deadline_waits_without_panicking() {
        let (reader, mut server) = reader();
        server
            .write_all(&packet(8, PacketType::RESPONSE_VALUE, "late"))
            .await
            .unwrap();

        let answers = reader.answers();
        let forever = Some(Duration::MAX);
        assert_eq!(answers.wait_for(8, forever).await.payload, "late");

        server
            .write_all(&packet(9, PacketType::AUTH_RESPONSE, ""))
            .await
            .unwrap();
        assert_eq!(answers.wait_for_login(9, forever).await, LoginAnswer::Accepted);
    }

    #[test]
    fn id_distance_wraps() {
        assert_eq!(id_distance(5, 2), 3);
        assert_eq!(id_distance(2, 5), 3);
        assert_eq!(id_distance(1, i32::MAX), 1);
        assert_eq!(id_distance(i32::MAX, 3), 3);
        assert_eq!(id_distance(7, 7), 0);
    }

    #[test]
    fn pruning_keeps_recent_ids_across_wrap() {
        let answers = Answers::new();
        let response = |id| Response {
            id,
            kind: PacketType::RESPONSE_VALUE,
            payload: "x".to_string(),
        };

        for id in (i32::MAX - 2)..=i32::MAX {
            answers.publish(response(id));
        }
        for id in 1..=1023 {
            answers.publish(response(id));
        }

        // 1023 is newest: MAX is 1023 ids behind it, MAX - 1 is 1024, MAX - 2 is 1025
        assert_eq!(answers.get_answer(i32::MAX).payload, "x");
        assert_eq!(answers.get_answer(i32::MAX - 1).payload, "x");
        assert!(answers.get_answer(i32::MAX - 2).is_empty());
        assert_eq!(answers.get_answer(1).payload, "x");
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let (mut reader, _server) = reader();
        let answers = reader.answers().clone();

        reader.dispose();
        reader.dispose();

        assert!(!answers.is_alive());
        assert!(answers.wait_for(1, None).await.is_empty());
    }
}
