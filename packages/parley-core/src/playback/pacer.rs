//! The per-stream paced emitter.
//!
//! One task per stream, driven by a monotonic 20ms metronome
//! (`tokio::time::interval` with `MissedTickBehavior::Burst` so a delayed
//! tick catches up instead of drifting). Pacing is wall-clock based, not
//! frame-count based: provider burst jitter cannot compound into drift,
//! and any schedule slip past the tolerance is counted as an underflow.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::audio::AudioFrame;
use crate::protocol_constants::FRAME_DURATION_MS;

use super::{EndReason, ManagerInner, PlaybackSignal, StreamPhase, StreamShared};

/// Schedule slip past this is logged and counted as an underflow.
const SLIP_TOLERANCE: Duration = Duration::from_millis(10);

/// Runs the pacer until the stream ends. Spawned by
/// [`PlaybackManager::start_stream`](super::PlaybackManager::start_stream).
pub(crate) async fn run(
    manager: Arc<ManagerInner>,
    shared: Arc<StreamShared>,
    sink: mpsc::Sender<AudioFrame>,
) {
    let frame_duration = Duration::from_millis(u64::from(FRAME_DURATION_MS));
    let mut metronome = interval(frame_duration);
    metronome.set_missed_tick_behavior(MissedTickBehavior::Burst);

    let silence = shared.egress.silence(FRAME_DURATION_MS);
    let config = &manager.config;

    // Wall-clock emission schedule, anchored when the stream starts playing.
    let mut play_epoch: Option<(Instant, u64)> = None;

    loop {
        tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => break,

            _ = metronome.tick() => {
                let now = Instant::now();
                let mut to_send: Option<Bytes> = None;
                {
                    let mut inner = shared.inner.lock();

                    // Priming exit: enough buffered, provider finished
                    // early, or the chunk flow paused with audio in hand.
                    if inner.phase == StreamPhase::Priming {
                        let depth = inner.depth_ms(shared.egress);
                        let gap_ms = inner.last_chunk_at.elapsed().as_millis() as u64;
                        let should_start = depth >= config.min_start_ms
                            || inner.done
                            || (depth > 0 && gap_ms >= config.jitter_buffer_ms);
                        if should_start {
                            inner.phase = StreamPhase::Playing;
                            play_epoch = Some((now, 0));
                            signal(&manager, PlaybackSignal::Started {
                                call_id: shared.call_id.clone(),
                                stream_id: shared.stream_id.clone(),
                            });
                            log::debug!(
                                "[Playback] {} playing ({}ms primed)",
                                shared.stream_id,
                                depth
                            );
                        }
                    }

                    match inner.phase {
                        StreamPhase::Priming => {
                            // Nothing is emitted while priming.
                        }
                        StreamPhase::Ended => break,
                        StreamPhase::Playing | StreamPhase::Stalled => {
                            if let Some(frame) = inner.queue.pop_front() {
                                inner.frames_emitted += 1;
                                to_send = Some(frame);

                                let depth = inner.depth_ms(shared.egress);
                                if inner.phase == StreamPhase::Playing
                                    && depth < config.low_watermark_ms
                                    && !inner.done
                                {
                                    inner.phase = StreamPhase::Stalled;
                                    signal(&manager, PlaybackSignal::Stalled {
                                        call_id: shared.call_id.clone(),
                                        stream_id: shared.stream_id.clone(),
                                    });
                                    log::debug!(
                                        "[Playback] {} under low watermark ({}ms)",
                                        shared.stream_id,
                                        depth
                                    );
                                } else if inner.phase == StreamPhase::Stalled
                                    && depth >= config.min_start_ms
                                {
                                    inner.phase = StreamPhase::Playing;
                                    log::debug!(
                                        "[Playback] {} refilled ({}ms), resuming",
                                        shared.stream_id,
                                        depth
                                    );
                                }

                                if inner.queue.is_empty()
                                    && inner.leftover.is_empty()
                                    && inner.done
                                {
                                    inner.phase = StreamPhase::Ended;
                                    inner.end_reason = Some(EndReason::Completed);
                                }
                            } else if inner.done {
                                inner.phase = StreamPhase::Ended;
                                inner.end_reason = Some(EndReason::Completed);
                            } else {
                                // Starved: hold downstream timing with
                                // silence while waiting for a refill.
                                if inner.phase == StreamPhase::Playing {
                                    inner.phase = StreamPhase::Stalled;
                                    signal(&manager, PlaybackSignal::Stalled {
                                        call_id: shared.call_id.clone(),
                                        stream_id: shared.stream_id.clone(),
                                    });
                                }
                                inner.underflows += 1;
                                to_send = Some(silence.clone());

                                let starved_ms =
                                    inner.last_chunk_at.elapsed().as_millis() as u64;
                                if starved_ms >= config.fallback_timeout_ms
                                    && !inner.fallback_requested
                                {
                                    inner.fallback_requested = true;
                                    signal(&manager, PlaybackSignal::FallbackWanted {
                                        call_id: shared.call_id.clone(),
                                        stream_id: shared.stream_id.clone(),
                                    });
                                    log::warn!(
                                        "[Playback] {} starved for {}ms, requesting fallback",
                                        shared.stream_id,
                                        starved_ms
                                    );
                                }
                            }

                            // Slip accounting against the wall-clock schedule.
                            if let Some((epoch, emitted)) = play_epoch.as_mut() {
                                let expected = *epoch + frame_duration * (*emitted as u32);
                                let slip = now.saturating_duration_since(expected);
                                if slip > SLIP_TOLERANCE {
                                    inner.underflows += 1;
                                    log::warn!(
                                        "[Playback] {} schedule slipped {}ms",
                                        shared.stream_id,
                                        slip.as_millis()
                                    );
                                }
                                *emitted += 1;
                            }
                        }
                    }
                }

                if let Some(payload) = to_send {
                    match sink.try_send(AudioFrame::new(payload, shared.egress)) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            // The writer is behind; dropping keeps our
                            // cadence honest rather than bursting later.
                            let mut inner = shared.inner.lock();
                            inner.underflows += 1;
                            log::trace!(
                                "[Playback] {} outbound sink full, frame dropped",
                                shared.stream_id
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            let mut inner = shared.inner.lock();
                            inner.queue.clear();
                            inner.leftover.clear();
                            inner.phase = StreamPhase::Ended;
                            inner
                                .end_reason
                                .get_or_insert(EndReason::Cancelled("sink-closed"));
                            break;
                        }
                    }
                }
            }
        }
    }

    finish(&manager, &shared);
}

/// Removes the stream from the manager and reports final stats.
fn finish(manager: &Arc<ManagerInner>, shared: &Arc<StreamShared>) {
    let (reason, frames_emitted, underflows, short_reads) = {
        let mut inner = shared.inner.lock();
        inner.phase = StreamPhase::Ended;
        (
            inner.end_reason.unwrap_or(EndReason::Completed),
            inner.frames_emitted,
            inner.underflows,
            inner.short_reads,
        )
    };

    // Only reap our own entry; a replacement stream may already be live.
    manager
        .streams
        .remove_if(&shared.call_id, |_, s| Arc::ptr_eq(s, shared));

    log::info!(
        "[Playback] {} ended ({:?}): frames={}, underflows={}, short_reads={}",
        shared.stream_id,
        reason,
        frames_emitted,
        underflows,
        short_reads
    );
    signal(
        manager,
        PlaybackSignal::Ended {
            call_id: shared.call_id.clone(),
            stream_id: shared.stream_id.clone(),
            reason,
            frames_emitted,
            underflows,
        },
    );
}

fn signal(manager: &Arc<ManagerInner>, signal: PlaybackSignal) {
    // Err means the orchestrator is gone, which only happens at shutdown.
    let _ = manager.signals.send(signal);
}

#[cfg(test)]
mod tests {
    use super::super::{PlaybackManager, PlaybackSignal};
    use crate::audio::{pcm16_to_bytes, AudioFrame, Codec};
    use crate::state::StreamingConfig;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const PROVIDER: Codec = Codec::pcm16(24000);
    const EGRESS: Codec = Codec::mulaw_8k();

    fn setup() -> (
        PlaybackManager,
        mpsc::UnboundedReceiver<PlaybackSignal>,
        mpsc::Receiver<AudioFrame>,
    ) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let manager = PlaybackManager::new(StreamingConfig::default(), signal_tx);
        let (sink_tx, sink_rx) = mpsc::channel(512);
        manager.attach_sink("c1", sink_tx);
        (manager, signal_rx, sink_rx)
    }

    fn chunk_ms(ms: u64) -> Bytes {
        pcm16_to_bytes(&vec![2000i16; (24_000 * ms / 1000) as usize])
    }

    async fn collect_frames(
        sink: &mut mpsc::Receiver<AudioFrame>,
        expected: usize,
        budget: Duration,
    ) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let _ = timeout(budget, async {
            while frames.len() < expected {
                match sink.recv().await {
                    Some(frame) => frames.push(frame),
                    None => break,
                }
            }
        })
        .await;
        frames
    }

    #[tokio::test(start_paused = true)]
    async fn clean_response_emits_expected_frame_count() {
        let (manager, mut signals, mut sink) = setup();
        let handle = manager
            .start_stream("c1", true, PROVIDER, EGRESS)
            .unwrap();

        // 12 chunks of 80ms = 960ms of audio, then done.
        for _ in 0..12 {
            handle.push_chunk(chunk_ms(80), PROVIDER).unwrap();
        }
        handle.mark_done();

        // 960ms / 20ms = 48 outbound frames.
        let frames = collect_frames(&mut sink, 48, Duration::from_secs(10)).await;
        assert_eq!(frames.len(), 48);
        assert!(frames
            .iter()
            .all(|f| f.payload.len() == EGRESS.frame_bytes(20)));

        // Started then Ended(Completed), with no stall in between.
        let mut saw_started = false;
        let mut saw_completed = false;
        while let Ok(signal) = signals.try_recv() {
            match signal {
                PlaybackSignal::Started { .. } => saw_started = true,
                PlaybackSignal::Ended { reason, frames_emitted, .. } => {
                    assert_eq!(reason, super::super::EndReason::Completed);
                    assert_eq!(frames_emitted, 48);
                    saw_completed = true;
                }
                PlaybackSignal::Stalled { .. } | PlaybackSignal::FallbackWanted { .. } => {
                    panic!("unexpected stall in a clean response")
                }
            }
        }
        assert!(saw_started && saw_completed);
        assert!(!manager.has_active("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn priming_holds_until_min_start() {
        let (manager, _signals, mut sink) = setup();
        let handle = manager
            .start_stream("c1", true, PROVIDER, EGRESS)
            .unwrap();

        // 280ms buffered: below the 300ms threshold, chunks still flowing.
        handle.push_chunk(chunk_ms(140), PROVIDER).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.push_chunk(chunk_ms(140), PROVIDER).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(
            sink.try_recv().is_err(),
            "nothing may be emitted while priming"
        );

        // Reaching exactly min_start starts playback on the next tick.
        handle.push_chunk(chunk_ms(20), PROVIDER).unwrap();
        let frames = collect_frames(&mut sink, 1, Duration::from_millis(100)).await;
        assert_eq!(frames.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn early_done_flushes_a_short_utterance() {
        let (manager, _signals, mut sink) = setup();
        let handle = manager
            .start_stream("c1", false, PROVIDER, EGRESS)
            .unwrap();

        // One 20ms frame, then done before min_start is ever reached.
        handle.push_chunk(chunk_ms(20), PROVIDER).unwrap();
        handle.mark_done();

        let frames = collect_frames(&mut sink, 2, Duration::from_secs(2)).await;
        assert_eq!(frames.len(), 1, "exactly the one buffered frame");
        assert!(!manager.has_active("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn starvation_requests_fallback_exactly_once() {
        let (manager, mut signals, mut sink) = setup();
        let handle = manager
            .start_stream("c1", true, PROVIDER, EGRESS)
            .unwrap();

        // 200ms of audio, then the provider goes quiet.
        handle.push_chunk(chunk_ms(200), PROVIDER).unwrap();

        // The 200ms drains (after the jitter-window priming exit) and the
        // pacer then survives on silence until the fallback timeout.
        let real = collect_frames(&mut sink, 10, Duration::from_secs(2)).await;
        assert_eq!(real.len(), 10);

        // Run well past fallback_timeout_ms.
        let silence = collect_frames(&mut sink, 200, Duration::from_secs(6)).await;
        assert!(
            silence.iter().all(|f| f.payload.iter().all(|&b| b == 0xFF)),
            "starved stream emits mu-law silence"
        );

        let mut stalled = 0;
        let mut fallbacks = 0;
        while let Ok(signal) = signals.try_recv() {
            match signal {
                PlaybackSignal::Stalled { .. } => stalled += 1,
                PlaybackSignal::FallbackWanted { .. } => fallbacks += 1,
                _ => {}
            }
        }
        assert_eq!(fallbacks, 1, "fallback is requested exactly once");
        assert!(stalled >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_emission_within_a_tick() {
        let (manager, mut signals, mut sink) = setup();
        let handle = manager
            .start_stream("c1", true, PROVIDER, EGRESS)
            .unwrap();

        handle.push_chunk(chunk_ms(400), PROVIDER).unwrap();
        let _ = collect_frames(&mut sink, 5, Duration::from_secs(2)).await;

        handle.cancel("barge-in");
        // Drain anything already sunk, then confirm nothing more arrives.
        tokio::time::sleep(Duration::from_millis(200)).await;
        while sink.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            sink.try_recv().is_err(),
            "no frames after cancel"
        );

        let ended = loop {
            match signals.recv().await.unwrap() {
                PlaybackSignal::Ended { reason, .. } => break reason,
                _ => continue,
            }
        };
        assert_eq!(ended, super::super::EndReason::Cancelled("barge-in"));
    }
}
