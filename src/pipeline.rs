use crate::conn::{ConnError, StoreConnection};
use crate::decode::{CivilTime, PayloadDecoder, NUM_STREAMS, CHANNEL_EXTRACTORS};
use crate::feed::{SourceBatch, SourceFeed, COMPLETION_WATERMARK};
use crate::pool::EnvelopePool;
use crate::wire::{StatusCode, POINTS_PER_MESSAGE};
use chrono::NaiveDate;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Capture-time plausibility window; years outside it mean a corrupted
/// record, not a real measurement.
const YEAR_MIN: i32 = 2010;
const YEAR_MAX: i32 = 2020;

/// Aggregate of per-channel transmission results for one batch. Only
/// transport failures count; a non-OK ack never fails the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub issued: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Blocks until every issued channel-send for a batch has reported its
/// transmission result. This is the backpressure point that keeps the
/// completion-tag update behind all outstanding sends.
pub struct CompletionTracker {
    rx: mpsc::UnboundedReceiver<Result<(), ConnError>>,
    expected: usize,
}

impl CompletionTracker {
    fn new(rx: mpsc::UnboundedReceiver<Result<(), ConnError>>, expected: usize) -> Self {
        Self { rx, expected }
    }

    pub async fn resolve(mut self) -> BatchOutcome {
        let mut drained = 0usize;
        let mut failed = 0usize;
        while drained < self.expected {
            match self.rx.recv().await {
                Some(Ok(())) => drained += 1,
                Some(Err(_)) => {
                    drained += 1;
                    failed += 1;
                }
                // A sender dropped without reporting (task panic); count the
                // missing signals as failures rather than hanging.
                None => {
                    failed += self.expected - drained;
                    break;
                }
            }
        }
        BatchOutcome {
            issued: self.expected,
            failed,
        }
    }
}

pub struct Inserter {
    conn: Arc<StoreConnection>,
    pool: Arc<EnvelopePool>,
    targets: [Uuid; NUM_STREAMS],
    decoder: Arc<dyn PayloadDecoder>,
    inflight: Arc<Semaphore>,
}

impl Inserter {
    pub fn new(
        conn: Arc<StoreConnection>,
        targets: [Uuid; NUM_STREAMS],
        decoder: Arc<dyn PayloadDecoder>,
        max_inflight: usize,
    ) -> Self {
        Self {
            conn,
            pool: Arc::new(EnvelopePool::new()),
            targets,
            decoder,
            inflight: Arc::new(Semaphore::new(max_inflight)),
        }
    }

    /// Decodes one batch, fans every validated sample out as 13 concurrent
    /// channel-sends over the shared connection, and raises the batch's
    /// completion tag iff every transmission succeeded. On failure the tag
    /// is left untouched so the whole batch is redelivered next pass.
    /// Returns the resolved outcome, or `None` if the payload could not be
    /// decoded and no completion decision was made.
    pub async fn forward_batch(
        &self,
        feed: &dyn SourceFeed,
        batch: &SourceBatch,
    ) -> Option<BatchOutcome> {
        let samples = match self.decoder.decode(batch.payload()) {
            Ok(samples) => samples,
            Err(err) => {
                tracing::warn!(batch = %batch.id, error = %err, "payload decode failed; leaving batch for retry");
                return None;
            }
        };

        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let mut issued = 0usize;
        for sample in &samples {
            let Some(base_time) = sample_base_time(&sample.time) else {
                continue;
            };
            tracing::debug!(batch = %batch.id, base_time, "inserting sample");
            for (channel, target) in self.targets.iter().enumerate() {
                let extract = CHANNEL_EXTRACTORS[channel];
                let mut values = [0.0f64; POINTS_PER_MESSAGE];
                for (i, value) in values.iter_mut().enumerate() {
                    *value = extract(sample, i);
                }
                let permit = match Arc::clone(&self.inflight).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return None,
                };
                tokio::spawn(insert_channel(
                    Arc::clone(&self.conn),
                    Arc::clone(&self.pool),
                    *target,
                    base_time,
                    values,
                    outcome_tx.clone(),
                    permit,
                ));
                issued += 1;
            }
        }
        drop(outcome_tx);

        let outcome = CompletionTracker::new(outcome_rx, issued).resolve().await;
        if outcome.is_success() {
            if let Err(err) = feed.mark_complete(batch.id, COMPLETION_WATERMARK).await {
                tracing::warn!(batch = %batch.id, error = %err, "could not update completion tag; batch will be retried");
            }
        } else {
            tracing::warn!(
                batch = %batch.id,
                failed = outcome.failed,
                issued = outcome.issued,
                "batch had transmission failures; leaving it for the next pass"
            );
        }
        Some(outcome)
    }
}

/// One channel-send: build the envelope from the pool, transmit it, report
/// the transmission result, then await the ack. Ack problems are warnings
/// only and never affect the already-reported outcome.
async fn insert_channel(
    conn: Arc<StoreConnection>,
    pool: Arc<EnvelopePool>,
    target: Uuid,
    base_time: i64,
    values: [f64; POINTS_PER_MESSAGE],
    outcome_tx: mpsc::UnboundedSender<Result<(), ConnError>>,
    _permit: OwnedSemaphorePermit,
) {
    let (tag, ack_rx) = conn.register();
    let mut builder = pool.acquire();
    builder.begin(tag, &target);
    for (i, point) in builder.points_mut().iter_mut().enumerate() {
        point.time_nanos = base_time + point_offset_nanos(i);
        point.value = values[i];
    }
    let sent = match builder.encode() {
        Ok(frame) => conn.transmit(frame).await,
        Err(err) => Err(ConnError::Encode(err)),
    };
    pool.release(builder);

    let failed = sent.is_err();
    if let Err(err) = &sent {
        tracing::warn!(stream = %target, error = %err, "envelope transmission failed");
    }
    let _ = outcome_tx.send(sent);
    if failed {
        conn.forget(tag);
        return;
    }

    match ack_rx.await {
        Ok(response) => {
            if response.status() != StatusCode::Ok {
                tracing::warn!(stream = %target, status = ?response.status(), "destination returned non-OK status");
            }
        }
        Err(_) => {
            tracing::warn!(stream = %target, "no response received for envelope");
        }
    }
}

/// Nanosecond offset of sub-point `i` within the sample's one-second span.
fn point_offset_nanos(i: usize) -> i64 {
    (i as f64 * 1e9 / POINTS_PER_MESSAGE as f64).round() as i64
}

/// UTC epoch nanoseconds for a civil tuple, or `None` for records whose
/// timestamp is implausible or unrepresentable (the sample is skipped, with
/// a diagnostic, and no outcomes are recorded for its channels).
fn sample_base_time(time: &CivilTime) -> Option<i64> {
    if !(YEAR_MIN..=YEAR_MAX).contains(&time.year) {
        tracing::warn!(year = time.year, "rejecting sample with implausible capture year");
        return None;
    }
    let Some(date) = NaiveDate::from_ymd_opt(time.year, time.month, time.day) else {
        tracing::warn!(?time, "rejecting sample with unrepresentable date");
        return None;
    };
    let Some(datetime) = date.and_hms_opt(time.hour, time.minute, time.second) else {
        tracing::warn!(?time, "rejecting sample with unrepresentable clock time");
        return None;
    };
    datetime.and_utc().timestamp_nanos_opt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{encode_frame, sample_at, FrameDecoder};
    use crate::feed::mock::MockFeed;
    use crate::wire::{self, InsertRequest, InsertResponse};
    use bytes::BytesMut;
    use futures::TryStreamExt;
    use prost::Message;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    const TIME: CivilTime = CivilTime {
        year: 2015,
        month: 6,
        day: 1,
        hour: 12,
        minute: 0,
        second: 0,
    };
    const BASE_NANOS: i64 = 1_433_160_000_000_000_000;

    fn targets() -> [Uuid; NUM_STREAMS] {
        std::array::from_fn(|_| Uuid::new_v4())
    }

    /// In-process destination: accepts one connection, records every insert
    /// request and acks each with the given status.
    async fn spawn_ack_server(status: StatusCode) -> (std::net::SocketAddr, Arc<Mutex<Vec<InsertRequest>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            while let Ok(Some(request)) =
                wire::read_message::<InsertRequest, _>(&mut reader).await
            {
                let mut buf = BytesMut::new();
                InsertResponse {
                    echo_tag: request.echo_tag,
                    status: status as i32,
                }
                .encode_length_delimited(&mut buf)
                .unwrap();
                seen_clone.lock().unwrap().push(request);
                if write_half.write_all(&buf).await.is_err() {
                    break;
                }
            }
        });
        (addr, seen)
    }

    async fn inserter_for(addr: std::net::SocketAddr, targets: [Uuid; NUM_STREAMS]) -> Inserter {
        let stream = TcpStream::connect(addr).await.unwrap();
        Inserter::new(
            Arc::new(StoreConnection::from_stream(stream)),
            targets,
            Arc::new(FrameDecoder),
            64,
        )
    }

    async fn wait_for_envelopes(seen: &Arc<Mutex<Vec<InsertRequest>>>, count: usize) {
        for _ in 0..200 {
            if seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("destination saw {} envelopes, expected {count}", seen.lock().unwrap().len());
    }

    #[test]
    fn civil_tuple_converts_to_utc_epoch_nanos() {
        assert_eq!(sample_base_time(&TIME), Some(BASE_NANOS));
    }

    #[test]
    fn years_outside_the_plausibility_window_are_rejected() {
        for year in [2009, 2021] {
            let time = CivilTime { year, ..TIME };
            assert_eq!(sample_base_time(&time), None);
        }
        assert!(sample_base_time(&CivilTime { year: 2010, ..TIME }).is_some());
        assert!(sample_base_time(&CivilTime { year: 2020, ..TIME }).is_some());
    }

    #[test]
    fn unrepresentable_dates_are_rejected() {
        let time = CivilTime { month: 13, ..TIME };
        assert_eq!(sample_base_time(&time), None);
    }

    #[test]
    fn point_offsets_cover_one_second_at_120hz() {
        assert_eq!(point_offset_nanos(0), 0);
        assert_eq!(point_offset_nanos(1), 8_333_333);
        assert_eq!(point_offset_nanos(2), 16_666_667);
        assert_eq!(point_offset_nanos(119), 991_666_667);
        for i in 1..POINTS_PER_MESSAGE {
            assert!(point_offset_nanos(i) > point_offset_nanos(i - 1));
        }
    }

    #[tokio::test]
    async fn tracker_fails_the_batch_on_any_transmission_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        for _ in 0..12 {
            tx.send(Ok(())).unwrap();
        }
        tx.send(Err(ConnError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        ))))
        .unwrap();
        drop(tx);
        let outcome = CompletionTracker::new(rx, 13).resolve().await;
        assert_eq!(outcome, BatchOutcome { issued: 13, failed: 1 });
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn tracker_succeeds_when_every_send_reports_ok() {
        let (tx, rx) = mpsc::unbounded_channel();
        for _ in 0..26 {
            tx.send(Ok(())).unwrap();
        }
        drop(tx);
        let outcome = CompletionTracker::new(rx, 26).resolve().await;
        assert!(outcome.is_success());
        assert_eq!(outcome.issued, 26);
    }

    #[tokio::test]
    async fn one_sample_batch_sends_one_envelope_per_channel() {
        let (addr, seen) = spawn_ack_server(StatusCode::Ok).await;
        let targets = targets();
        let inserter = inserter_for(addr, targets).await;

        let sample = sample_at(TIME);
        let feed = MockFeed::new(vec![MockFeed::batch("U1", encode_frame(&sample))]);
        let batch = feed.select_eligible("U1").await.unwrap().try_next().await.unwrap().unwrap();

        inserter.forward_batch(&feed, &batch).await;
        wait_for_envelopes(&seen, NUM_STREAMS).await;

        let envelopes = seen.lock().unwrap().clone();
        assert_eq!(envelopes.len(), NUM_STREAMS);
        let mut seen_targets = Vec::new();
        for envelope in &envelopes {
            let insert = envelope.insert.as_ref().unwrap();
            assert!(!insert.sync);
            assert_eq!(insert.points.len(), POINTS_PER_MESSAGE);
            assert_eq!(insert.points[0].time_nanos, BASE_NANOS);
            for (i, point) in insert.points.iter().enumerate() {
                assert_eq!(point.time_nanos, BASE_NANOS + point_offset_nanos(i));
            }

            // Values must belong to the channel the target uuid names.
            let target = Uuid::from_slice(&insert.stream_uuid).unwrap();
            let channel = targets.iter().position(|t| *t == target).unwrap();
            for (i, point) in insert.points.iter().enumerate() {
                assert_eq!(point.value, CHANNEL_EXTRACTORS[channel](&sample, i));
            }
            seen_targets.push(target);
        }
        seen_targets.sort();
        let mut expected = targets.to_vec();
        expected.sort();
        assert_eq!(seen_targets, expected);

        let completed = feed.completed.lock().unwrap().clone();
        assert_eq!(completed, vec![(batch.id, COMPLETION_WATERMARK)]);
    }

    #[tokio::test]
    async fn two_sample_batch_drains_all_twenty_six_outcomes() {
        let (addr, seen) = spawn_ack_server(StatusCode::Ok).await;
        let inserter = inserter_for(addr, targets()).await;

        let mut payload = encode_frame(&sample_at(TIME));
        let later = CivilTime { second: 1, ..TIME };
        payload.extend_from_slice(&encode_frame(&sample_at(later)));
        let feed = MockFeed::new(vec![MockFeed::batch("U1", payload)]);
        let batch = feed.select_eligible("U1").await.unwrap().try_next().await.unwrap().unwrap();

        let outcome = inserter.forward_batch(&feed, &batch).await;
        wait_for_envelopes(&seen, 2 * NUM_STREAMS).await;
        assert_eq!(seen.lock().unwrap().len(), 2 * NUM_STREAMS);
        // The resolved outcome must account for every send of every sample,
        // not just one sample's worth of channels.
        assert_eq!(
            outcome,
            Some(BatchOutcome { issued: 2 * NUM_STREAMS, failed: 0 })
        );
        assert_eq!(feed.completed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn implausible_sample_is_skipped_without_sends() {
        let (addr, seen) = spawn_ack_server(StatusCode::Ok).await;
        let inserter = inserter_for(addr, targets()).await;

        let bad = CivilTime { year: 2009, ..TIME };
        let mut payload = encode_frame(&sample_at(bad));
        payload.extend_from_slice(&encode_frame(&sample_at(TIME)));
        let feed = MockFeed::new(vec![MockFeed::batch("U1", payload)]);
        let batch = feed.select_eligible("U1").await.unwrap().try_next().await.unwrap().unwrap();

        let outcome = inserter.forward_batch(&feed, &batch).await;
        // Only the valid sample's channels are sent.
        wait_for_envelopes(&seen, NUM_STREAMS).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), NUM_STREAMS);
        assert_eq!(outcome, Some(BatchOutcome { issued: NUM_STREAMS, failed: 0 }));
        assert_eq!(feed.completed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_ok_ack_does_not_block_completion() {
        let (addr, seen) = spawn_ack_server(StatusCode::InternalError).await;
        let inserter = inserter_for(addr, targets()).await;

        let feed = MockFeed::new(vec![MockFeed::batch("U1", encode_frame(&sample_at(TIME)))]);
        let batch = feed.select_eligible("U1").await.unwrap().try_next().await.unwrap().unwrap();

        inserter.forward_batch(&feed, &batch).await;
        wait_for_envelopes(&seen, NUM_STREAMS).await;
        assert_eq!(
            feed.completed.lock().unwrap().clone(),
            vec![(batch.id, COMPLETION_WATERMARK)]
        );
    }

    #[tokio::test]
    async fn transmission_failure_leaves_the_completion_tag_untouched() {
        let (addr, _seen) = spawn_ack_server(StatusCode::Ok).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let conn = Arc::new(StoreConnection::from_stream(stream));
        // Closing the write half up front makes every transmit fail.
        conn.shutdown().await.unwrap();
        let inserter = Inserter::new(conn, targets(), Arc::new(FrameDecoder), 64);

        let feed = MockFeed::new(vec![MockFeed::batch("U1", encode_frame(&sample_at(TIME)))]);
        let batch = feed.select_eligible("U1").await.unwrap().try_next().await.unwrap().unwrap();

        let outcome = inserter.forward_batch(&feed, &batch).await;
        assert_eq!(
            outcome,
            Some(BatchOutcome { issued: NUM_STREAMS, failed: NUM_STREAMS })
        );
        assert!(feed.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_batch_is_left_for_retry() {
        let (addr, seen) = spawn_ack_server(StatusCode::Ok).await;
        let inserter = inserter_for(addr, targets()).await;

        let feed = MockFeed::new(vec![MockFeed::batch("U1", vec![1, 2, 3])]);
        let batch = feed.select_eligible("U1").await.unwrap().try_next().await.unwrap().unwrap();

        let outcome = inserter.forward_batch(&feed, &batch).await;
        assert_eq!(outcome, None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().unwrap().is_empty());
        assert!(feed.completed.lock().unwrap().is_empty());
    }
}
